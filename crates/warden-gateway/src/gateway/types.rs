//! Shared records, error kinds, and error categories for the gateway crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Common name of the server's own certificate. Never listed, created, or revoked.
pub const SERVER_IDENTITY: &str = "server";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Allocation / session records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Snapshot of one pool slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub ip: Ipv4Addr,
    /// Owning client id, `None` when the slot is free.
    pub client: Option<String>,
}

impl Allocation {
    pub fn is_allocated(&self) -> bool {
        self.client.is_some()
    }
}

/// A connected client. Only created once the authentication pipeline fully succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub client: String,
    pub allocation: Allocation,
    /// CIDR routes pushed to the client, in discovery order.
    pub routes: Vec<String>,
    pub established_at: DateTime<Utc>,
    pub source_address: String,
    /// Resolved identity-provider username.
    pub identity: String,
}

impl Session {
    pub fn ip(&self) -> Ipv4Addr {
        self.allocation.ip
    }
}

/// A private address reservation discovered in the cloud inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub cidr: u8,
}

impl Subnet {
    /// `network/cidr` form used in session records and agent arguments.
    pub fn route(&self) -> String {
        format!("{}/{}", self.network, self.cidr)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.cidr)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Certificates
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Status of a client certificate as derived from the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateStatus {
    Valid,
    Expired,
    Revoked,
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valid => write!(f, "VALID"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Revoked => write!(f, "REVOKED"),
        }
    }
}

/// One client certificate, recomputed from the ledger on every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub client: String,
    pub status: CertificateStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Certificate record plus a freshly rendered client profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDetails {
    pub status: CertificateStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub config: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Crate-level error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayErrorKind {
    /// Request carried no client id.
    MissingClient,
    /// Client id cannot be used as a file or certificate name.
    InvalidClientId,
    /// Credential bundle missing, unreadable, or malformed.
    BadCredentialFile,
    /// Provider accepted a plain password login.
    TwoFactorNotEnabled,
    /// Provider rejected password + one-time code.
    InvalidCredentials,
    /// Provider could not be reached.
    IdentityUnavailable,
    /// No bearer token in the provider response.
    TokenFetch,
    /// Cloud inventory enumeration failed.
    Inventory,
    /// Inventory returned nothing routable.
    NoRoutes,
    PoolExhausted,
    /// Network or certificate agent exited non-zero (or could not start).
    AgentFailed,
    /// Operation targeted the server's own identity.
    ReservedIdentity,
    /// No ledger entry for the client.
    UnknownClient,
    /// No active session for the client.
    NotConnected,
    Io,
    Config,
    /// Supervised VPN daemon failed.
    Daemon,
    Internal,
}

/// Coarse error taxonomy reported to callers alongside the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    InputValidation,
    UpstreamAuthentication,
    ResourceExhaustion,
    ExternalAgent,
    NotFound,
    Internal,
}

impl GatewayErrorKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingClient
            | Self::InvalidClientId
            | Self::BadCredentialFile
            | Self::ReservedIdentity => ErrorCategory::InputValidation,
            Self::TwoFactorNotEnabled
            | Self::InvalidCredentials
            | Self::IdentityUnavailable
            | Self::TokenFetch => ErrorCategory::UpstreamAuthentication,
            Self::PoolExhausted | Self::NoRoutes | Self::Inventory => {
                ErrorCategory::ResourceExhaustion
            }
            Self::AgentFailed => ErrorCategory::ExternalAgent,
            Self::UnknownClient | Self::NotConnected => ErrorCategory::NotFound,
            Self::Io | Self::Config | Self::Daemon | Self::Internal => ErrorCategory::Internal,
        }
    }
}

/// Crate-level error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(d) = &self.detail {
            write!(f, " ({})", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    pub fn new(kind: GatewayErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn bad_credential_file(msg: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::BadCredentialFile, msg)
    }

    pub fn agent_failed(msg: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::AgentFailed, msg)
    }

    pub fn io(msg: impl Into<String>, err: std::io::Error) -> Self {
        Self::new(GatewayErrorKind::Io, msg).with_detail(err.to_string())
    }

    pub fn not_connected(client: &str) -> Self {
        Self::new(
            GatewayErrorKind::NotConnected,
            format!("client `{}` has no active session", client),
        )
    }

    pub fn reserved_identity(action: &str) -> Self {
        Self::new(
            GatewayErrorKind::ReservedIdentity,
            format!("cannot {} `{}` certificate", action, SERVER_IDENTITY),
        )
    }
}

impl From<GatewayError> for String {
    fn from(e: GatewayError) -> String {
        e.to_string()
    }
}

/// Convenience alias for gateway results.
pub type GatewayResult<T> = Result<T, GatewayError>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Client id validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reject ids that are empty or unusable as a file name.
///
/// The client id names the per-client configuration file and the
/// certificate/key files, so it must be a single plain path component.
pub fn validate_client_id(client: &str) -> GatewayResult<()> {
    if client.is_empty() {
        return Err(GatewayError::new(
            GatewayErrorKind::MissingClient,
            "no client supplied",
        ));
    }
    let bad = client == "."
        || client == ".."
        || client
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control());
    if bad {
        return Err(GatewayError::new(
            GatewayErrorKind::InvalidClientId,
            format!("invalid client id `{}`", client.escape_debug()),
        ));
    }
    Ok(())
}
