//! Credential bundle parsing.
//!
//! The VPN daemon hands the gateway a two-line file: the username, then the
//! six-digit one-time code immediately followed by the password.

use crate::gateway::types::{GatewayError, GatewayResult};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Length of the one-time code prefix on the second line.
pub const OTP_LEN: usize = 6;

lazy_static! {
    static ref OTP_RE: Regex = Regex::new(r"^[0-9]{6}$").unwrap();
}

/// Username / password / one-time code taken from a credential bundle.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(skip_serializing)]
    pub otp: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"********")
            .field("otp", &"******")
            .finish()
    }
}

/// Parse bundle text.
pub fn parse_credentials(content: &str) -> GatewayResult<Credentials> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() != 2 {
        return Err(GatewayError::bad_credential_file(
            "invalid formatted file, expecting exactly 2 lines",
        )
        .with_detail(format!("found {} lines", lines.len())));
    }

    let username = lines[0].trim();
    if username.is_empty() {
        return Err(GatewayError::bad_credential_file("empty username"));
    }

    let secret = lines[1].trim_end_matches('\r');
    if secret.len() <= OTP_LEN {
        return Err(GatewayError::bad_credential_file("invalid password"));
    }

    let (otp, password) = match (secret.get(..OTP_LEN), secret.get(OTP_LEN..)) {
        (Some(o), Some(p)) => (o, p),
        _ => return Err(GatewayError::bad_credential_file("invalid two-factor token")),
    };
    if !OTP_RE.is_match(otp) {
        return Err(GatewayError::bad_credential_file("invalid two-factor token"));
    }

    Ok(Credentials {
        username: username.to_string(),
        password: password.to_string(),
        otp: otp.to_string(),
    })
}

/// Read and parse the bundle at `path`.
///
/// A missing path, a path that does not exist, and an unreadable file are
/// all reported as a bad credential file.
pub async fn read_credential_file(path: Option<&Path>) -> GatewayResult<Credentials> {
    let path = match path {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => return Err(GatewayError::bad_credential_file("no filename supplied")),
    };

    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(GatewayError::bad_credential_file("file does not exist")
                .with_detail(path.display().to_string()))
        }
        Err(e) => {
            return Err(GatewayError::bad_credential_file("cannot read credential file")
                .with_detail(format!("{}: {}", path.display(), e)))
        }
    };

    parse_credentials(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::types::GatewayErrorKind;

    #[test]
    fn splits_code_and_password() {
        let c = parse_credentials("alice\n123456secret").unwrap();
        assert_eq!(c.username, "alice");
        assert_eq!(c.otp, "123456");
        assert_eq!(c.password, "secret");
    }

    #[test]
    fn tolerates_trailing_newline_and_crlf() {
        let c = parse_credentials("alice\r\n654321hunter2\r\n").unwrap();
        assert_eq!(c.username, "alice");
        assert_eq!(c.otp, "654321");
        assert_eq!(c.password, "hunter2");
    }

    #[test]
    fn six_character_second_line_rejected() {
        let e = parse_credentials("alice\n123456").unwrap_err();
        assert_eq!(e.kind, GatewayErrorKind::BadCredentialFile);
    }

    #[test]
    fn wrong_line_count_rejected() {
        for input in ["alice", "alice\n123456pw\nextra", ""] {
            let e = parse_credentials(input).unwrap_err();
            assert_eq!(e.kind, GatewayErrorKind::BadCredentialFile, "{input:?}");
        }
    }

    #[test]
    fn empty_username_rejected() {
        let e = parse_credentials("\n123456secret").unwrap_err();
        assert_eq!(e.message, "empty username");
    }

    #[test]
    fn non_numeric_code_rejected() {
        let e = parse_credentials("alice\n12a456secret").unwrap_err();
        assert_eq!(e.kind, GatewayErrorKind::BadCredentialFile);
    }

    #[test]
    fn multibyte_prefix_does_not_panic() {
        let e = parse_credentials("alice\n12345éxyz").unwrap_err();
        assert_eq!(e.kind, GatewayErrorKind::BadCredentialFile);
    }

    #[test]
    fn debug_masks_secrets() {
        let c = parse_credentials("alice\n123456secret").unwrap();
        let dbg = format!("{:?}", c);
        assert!(!dbg.contains("secret"));
        assert!(!dbg.contains("123456"));
    }

    #[tokio::test]
    async fn reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds");
        std::fs::write(&path, "bob\n000111pa55\n").unwrap();
        let c = read_credential_file(Some(&path)).await.unwrap();
        assert_eq!(c.username, "bob");
        assert_eq!(c.password, "pa55");
    }

    #[tokio::test]
    async fn missing_file_and_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let e = read_credential_file(Some(&dir.path().join("nope"))).await.unwrap_err();
        assert_eq!(e.kind, GatewayErrorKind::BadCredentialFile);
        assert_eq!(e.message, "file does not exist");

        let e = read_credential_file(None).await.unwrap_err();
        assert_eq!(e.message, "no filename supplied");
    }
}
