//! Certificate-authority ledger reader.
//!
//! The ledger is an OpenSSL-style `index.txt`: one tab-separated record per
//! issued certificate, `flag, expiry, revocation, serial, file, dn`.
//! Records are recomputed on every call and never cached.

use crate::gateway::types::{
    CertificateRecord, CertificateStatus, GatewayError, GatewayErrorKind, GatewayResult,
    SERVER_IDENTITY,
};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::path::Path;

const DATE_FORMAT: &str = "%y%m%d%H%M%SZ";
const CN_PREFIX: &str = "/CN=";

/// Parse a ledger timestamp such as `160726174738Z`.
pub fn parse_ledger_time(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, DATE_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parse ledger text relative to `now`.
///
/// Lines without exactly six fields and the server's own entry are skipped.
pub fn parse_ledger(content: &str, now: DateTime<Utc>) -> Vec<CertificateRecord> {
    content
        .lines()
        .filter_map(|line| parse_line(line, now))
        .collect()
}

fn parse_line(line: &str, now: DateTime<Utc>) -> Option<CertificateRecord> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 6 {
        return None;
    }
    let client = fields[5].replacen(CN_PREFIX, "", 1);
    if client == SERVER_IDENTITY {
        return None;
    }

    let (status, expires_at) = if fields[0] == "R" {
        (CertificateStatus::Revoked, None)
    } else {
        let expires_at = parse_ledger_time(fields[1]);
        let status = match expires_at {
            Some(t) if t > now => CertificateStatus::Valid,
            _ => CertificateStatus::Expired,
        };
        (status, expires_at)
    };

    let revoked_at = if fields[2].is_empty() {
        None
    } else {
        parse_ledger_time(fields[2])
    };

    Some(CertificateRecord {
        client,
        status,
        expires_at,
        revoked_at,
    })
}

/// Read and parse the ledger file.
pub async fn read_ledger(path: &Path, now: DateTime<Utc>) -> GatewayResult<Vec<CertificateRecord>> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        GatewayError::io(format!("cannot read ledger {}", path.display()), e)
    })?;
    Ok(parse_ledger(&content, now))
}

/// Last record for `client`; a reissued certificate appends a newer line.
pub fn find_client<'a>(
    records: &'a [CertificateRecord],
    client: &str,
) -> GatewayResult<&'a CertificateRecord> {
    records
        .iter()
        .rev()
        .find(|r| r.client == client)
        .ok_or_else(|| {
            GatewayError::new(
                GatewayErrorKind::UnknownClient,
                format!("no certificate for client `{}`", client),
            )
        })
}
