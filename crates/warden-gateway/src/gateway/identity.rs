//! Identity-provider collaborator.
//!
//! Login is a `POST <api>/sessions?login=..&password=..` carrying the
//! consumer token. The first attempt omits the one-time code and is
//! *expected* to be refused; the second adds `X-OTP-Token` and must succeed
//! with a `{"id", "token"}` body.

use crate::gateway::credentials::Credentials;
use crate::gateway::types::{GatewayError, GatewayErrorKind, GatewayResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const REDACTED: &str = "********";

/// One login request.
#[derive(Clone)]
pub struct LoginAttempt {
    pub username: String,
    pub password: String,
    pub otp: Option<String>,
}

impl LoginAttempt {
    pub fn password_only(creds: &Credentials) -> Self {
        Self {
            username: creds.username.clone(),
            password: creds.password.clone(),
            otp: None,
        }
    }

    pub fn with_otp(creds: &Credentials) -> Self {
        Self {
            otp: Some(creds.otp.clone()),
            ..Self::password_only(creds)
        }
    }
}

/// Raw provider answer; status interpretation is up to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    pub status: u16,
    pub body: String,
}

impl LoginResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Bearer token returned by a successful two-factor login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub token: String,
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("id", &self.id)
            .field("token", &REDACTED)
            .finish()
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Submit one login. Only transport failures are errors.
    async fn login(&self, attempt: &LoginAttempt) -> GatewayResult<LoginResponse>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Login stages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A password-only login must be refused; acceptance means the account
/// has no second factor configured.
pub async fn validate_two_factor_enabled(
    provider: &dyn IdentityProvider,
    creds: &Credentials,
) -> GatewayResult<()> {
    let response = provider.login(&LoginAttempt::password_only(creds)).await?;
    if response.is_success() {
        return Err(GatewayError::new(
            GatewayErrorKind::TwoFactorNotEnabled,
            "2-factor not enabled",
        )
        .with_detail(format!("user `{}`", creds.username)));
    }
    Ok(())
}

/// Resubmit with the one-time code; anything but 2xx is a rejection.
pub async fn validate_credentials(
    provider: &dyn IdentityProvider,
    creds: &Credentials,
) -> GatewayResult<LoginResponse> {
    let response = provider.login(&LoginAttempt::with_otp(creds)).await?;
    if !response.is_success() {
        return Err(GatewayError::new(
            GatewayErrorKind::InvalidCredentials,
            "invalid username, password, or 2-factor token",
        )
        .with_detail(format!("status {}", response.status)));
    }
    Ok(response)
}

/// Decode the bearer token from a successful login body.
pub fn decode_token(body: &str) -> GatewayResult<AuthToken> {
    let token: AuthToken = serde_json::from_str(body).map_err(|e| {
        GatewayError::new(GatewayErrorKind::TokenFetch, "fetching API authentication token")
            .with_detail(e.to_string())
    })?;
    if token.token.is_empty() {
        return Err(GatewayError::new(
            GatewayErrorKind::TokenFetch,
            "fetching API authentication token",
        )
        .with_detail("empty token"));
    }
    Ok(token)
}

/// Render `url` with any non-empty `password` query value masked.
pub fn redact_password(url: &Url) -> String {
    let has_password = url
        .query_pairs()
        .any(|(k, v)| k == "password" && !v.is_empty());
    if !has_password {
        return url.to_string();
    }
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "password" { REDACTED.to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    let mut masked = url.clone();
    masked.query_pairs_mut().clear().extend_pairs(pairs);
    masked.to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  HTTP implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpIdentityProvider {
    http: Client,
    sessions_url: Url,
    consumer_token: String,
}

impl HttpIdentityProvider {
    pub fn new(api_host: &Url, consumer_token: impl Into<String>) -> GatewayResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                GatewayError::new(GatewayErrorKind::Internal, "building http client")
                    .with_detail(e.to_string())
            })?;
        let sessions_url = join_api(api_host, "sessions")?;
        Ok(Self {
            http,
            sessions_url,
            consumer_token: consumer_token.into(),
        })
    }

    fn login_url(&self, attempt: &LoginAttempt) -> Url {
        let mut url = self.sessions_url.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("login", &attempt.username)
            .append_pair("password", &attempt.password);
        url
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn login(&self, attempt: &LoginAttempt) -> GatewayResult<LoginResponse> {
        let url = self.login_url(attempt);
        let mut request = self
            .http
            .post(url.clone())
            .header("X-Consumer-Token", &self.consumer_token);
        if let Some(otp) = &attempt.otp {
            request = request.header("X-OTP-Token", otp);
        }

        let unavailable = |e: reqwest::Error| {
            GatewayError::new(
                GatewayErrorKind::IdentityUnavailable,
                "failed to connect to identity service",
            )
            .with_detail(format!("{} ({})", e.without_url(), redact_password(&url)))
        };

        let response = request.send().await.map_err(unavailable)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(unavailable)?;
        tracing::debug!(user = %attempt.username, status, otp = attempt.otp.is_some(), "identity login answered");
        Ok(LoginResponse { status, body })
    }
}

/// Append a path segment to the API base, keeping any base path.
pub(crate) fn join_api(api_host: &Url, path: &str) -> GatewayResult<Url> {
    let mut base = api_host.clone();
    if !base.path().ends_with('/') {
        let p = format!("{}/", base.path());
        base.set_path(&p);
    }
    base.join(path).map_err(|e| {
        GatewayError::new(GatewayErrorKind::Config, format!("invalid API url for `{}`", path))
            .with_detail(e.to_string())
    })
}
