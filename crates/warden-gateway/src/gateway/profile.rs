//! VPN client profile rendering.
//!
//! A profile is a self-contained OpenVPN client config with the CA,
//! the client certificate and its private key inlined.

use crate::gateway::types::{GatewayError, GatewayResult};
use std::path::{Path, PathBuf};

const CERT_BEGIN: &str = "-----BEGIN CERTIFICATE-----";

/// Keep only the PEM material from the first certificate marker onward.
///
/// `easy-rsa` prefixes issued certificates with an OpenSSL text dump; the
/// client only wants the PEM block. Input without a marker is only trimmed.
pub fn extract_certificate(raw: &str) -> String {
    match raw.find(CERT_BEGIN) {
        Some(idx) => raw[idx..].trim().to_string(),
        None => raw.trim().to_string(),
    }
}

/// Connection parameters that vary per deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileTemplate {
    pub remote_host: String,
    pub remote_port: u16,
}

impl ProfileTemplate {
    pub fn render(&self, ca: &str, cert: &str, key: &str) -> String {
        format!(
            "client\n\
             server-poll-timeout 4\n\
             nobind\n\
             remote {host} {port} tcp\n\
             dev tun\n\
             dev-type tun\n\
             reneg-sec 604800\n\
             sndbuf 100000\n\
             rcvbuf 100000\n\
             auth-user-pass\n\
             comp-lzo no\n\
             verb 3\n\
             setenv PUSH_PEER_INFO\n\
             \n\
             <ca>\n{ca}\n</ca>\n\
             \n\
             <cert>\n{cert}\n</cert>\n\
             \n\
             <key>\n{key}\n</key>",
            host = self.remote_host,
            port = self.remote_port,
            ca = ca,
            cert = cert,
            key = key,
        )
    }
}

/// Reads PKI material and renders client profiles.
#[derive(Debug, Clone)]
pub struct ProfileBuilder {
    pki_dir: PathBuf,
    template: ProfileTemplate,
}

impl ProfileBuilder {
    pub fn new(pki_dir: impl Into<PathBuf>, template: ProfileTemplate) -> Self {
        Self {
            pki_dir: pki_dir.into(),
            template,
        }
    }

    pub fn ca_path(&self) -> PathBuf {
        self.pki_dir.join("ca.crt")
    }

    pub fn cert_path(&self, client: &str) -> PathBuf {
        self.pki_dir.join("issued").join(format!("{}.crt", client))
    }

    pub fn key_path(&self, client: &str) -> PathBuf {
        self.pki_dir.join("private").join(format!("{}.key", client))
    }

    pub async fn build(&self, client: &str) -> GatewayResult<String> {
        let ca = read_pem(&self.ca_path()).await?;
        let cert = read_pem(&self.cert_path(client)).await?;
        let key = read_pem(&self.key_path(client)).await?;
        Ok(self.template.render(
            &extract_certificate(&ca),
            &extract_certificate(&cert),
            key.trim(),
        ))
    }
}

async fn read_pem(path: &Path) -> GatewayResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| GatewayError::io(format!("cannot read {}", path.display()), e))
}
