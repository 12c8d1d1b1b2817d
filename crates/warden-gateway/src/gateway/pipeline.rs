//! Authentication pipeline.
//!
//! ```text
//! ParseCredentials → ValidateTwoFactorEnabled → ValidateCredentials → ObtainToken
//!   → CheckAlreadyConnected → DiscoverSubnets → ReserveIp → ConfigureNetwork
//!   → CommitSession
//! ```
//!
//! Every request runs its own pass on the caller's task. Side effects from
//! `ReserveIp` onwards are recorded in a [`RollbackPlan`] and unwound before
//! the first error is returned. The per-client gate is held from
//! `CheckAlreadyConnected` through `CommitSession`, so concurrent attempts
//! for one client cannot both allocate.

use crate::gateway::config::Environment;
use crate::gateway::credentials::read_credential_file;
use crate::gateway::identity::{
    decode_token, validate_credentials, validate_two_factor_enabled, IdentityProvider,
};
use crate::gateway::inventory::{discover_subnets, Inventory};
use crate::gateway::rollback::{Compensation, Compensator, RollbackPlan};
use crate::gateway::state::GatewayContext;
use crate::gateway::types::{
    validate_client_id, GatewayError, GatewayErrorKind, GatewayResult, Session, Subnet,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Identity recorded for sessions created in the testing environment.
pub const TESTING_IDENTITY: &str = "00000000-0000-0000-0000-000000000001";

/// Operation label for error metrics.
const OP: &str = "authenticate";

/// Netmask pushed with the client's tunnel address.
const CLIENT_NETMASK: &str = "255.255.255.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    ParseCredentials,
    ValidateTwoFactorEnabled,
    ValidateCredentials,
    ObtainToken,
    CheckAlreadyConnected,
    DiscoverSubnets,
    ReserveIp,
    ConfigureNetwork,
    CommitSession,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ParseCredentials => "parse_credentials",
            Self::ValidateTwoFactorEnabled => "validate_two_factor_enabled",
            Self::ValidateCredentials => "validate_credentials",
            Self::ObtainToken => "obtain_token",
            Self::CheckAlreadyConnected => "check_already_connected",
            Self::DiscoverSubnets => "discover_subnets",
            Self::ReserveIp => "reserve_ip",
            Self::ConfigureNetwork => "configure_network",
            Self::CommitSession => "commit_session",
        };
        f.write_str(s)
    }
}

/// One `Authenticate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub client: String,
    /// Path of the credential bundle written by the VPN daemon.
    #[serde(default)]
    pub credential_file: Option<PathBuf>,
    #[serde(default)]
    pub source_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// A new session was committed.
    Connected(Session),
    /// The client already had a session; nothing was reconfigured.
    AlreadyConnected(Session),
}

impl AuthOutcome {
    pub fn session(&self) -> &Session {
        match self {
            Self::Connected(s) | Self::AlreadyConnected(s) => s,
        }
    }
}

/// Render the per-client configuration file: routes, then the tunnel address.
pub fn render_client_config(ip: Ipv4Addr, subnets: &[Subnet]) -> String {
    let mut out = String::new();
    for s in subnets {
        out.push_str(&format!("push \"route {} {}\"\n", s.network, s.netmask));
    }
    out.push_str(&format!("ifconfig-push {} {}\n", ip, CLIENT_NETMASK));
    out
}

type StageResult<T> = Result<T, (Stage, GatewayError)>;

trait AtStage<T> {
    fn at(self, stage: Stage) -> StageResult<T>;
}

impl<T> AtStage<T> for GatewayResult<T> {
    fn at(self, stage: Stage) -> StageResult<T> {
        self.map_err(|e| (stage, e))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Authenticator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Authenticator {
    ctx: GatewayContext,
    identity: Arc<dyn IdentityProvider>,
    inventory: Arc<dyn Inventory>,
    client_config_dir: PathBuf,
    environment: Environment,
}

impl Authenticator {
    pub fn new(
        ctx: GatewayContext,
        identity: Arc<dyn IdentityProvider>,
        inventory: Arc<dyn Inventory>,
        client_config_dir: impl Into<PathBuf>,
        environment: Environment,
    ) -> Self {
        Self {
            ctx,
            identity,
            inventory,
            client_config_dir: client_config_dir.into(),
            environment,
        }
    }

    pub fn client_config_path(&self, client: &str) -> PathBuf {
        self.client_config_dir.join(client)
    }

    /// Run the full pipeline for one request.
    pub async fn authenticate(&self, req: &AuthRequest) -> GatewayResult<AuthOutcome> {
        info!(client = %req.client, address = %req.source_address, "received authenticate request");
        match self.run(req).await {
            Ok(outcome) => Ok(outcome),
            Err((stage, e)) => {
                warn!(
                    client = %req.client,
                    address = %req.source_address,
                    stage = %stage,
                    kind = ?e.kind,
                    error = %e,
                    "authentication failed"
                );
                Err(e)
            }
        }
    }

    async fn run(&self, req: &AuthRequest) -> StageResult<AuthOutcome> {
        validate_client_id(&req.client).at(Stage::ParseCredentials)?;
        let client = req.client.as_str();

        let (identity, token) = if self.environment.is_testing() {
            (TESTING_IDENTITY.to_string(), String::new())
        } else {
            self.verify_identity(req).await?
        };

        let _gate = self.ctx.gates.acquire(client).await;

        if let Some(existing) = self.ctx.state.lookup(client).await {
            info!(
                client,
                ip = %existing.ip(),
                "client already connected, reusing session"
            );
            return Ok(AuthOutcome::AlreadyConnected(existing));
        }

        let subnets = discover_subnets(self.inventory.clone(), &token)
            .await
            .at(Stage::DiscoverSubnets)?;

        let mut plan = RollbackPlan::new();
        let allocation = match self.ctx.state.reserve(client).await {
            Ok(a) => a,
            Err(e) => {
                self.ctx.metrics.error(OP, e.kind);
                return Err((Stage::ReserveIp, e));
            }
        };
        plan.push(Compensation::ReleaseAddress {
            client: client.to_string(),
        });

        let path = self.client_config_path(client);
        if let Err(e) = self
            .configure_network(allocation.ip, &subnets, &path, &mut plan)
            .await
        {
            self.ctx.metrics.error(OP, e.kind);
            let compensator = Compensator {
                state: &self.ctx.state,
                network: self.ctx.network.as_ref(),
            };
            for failed in plan.unwind(&compensator).await {
                self.ctx.metrics.error("rollback", failed.kind);
            }
            return Err((Stage::ConfigureNetwork, e));
        }

        let session = Session {
            client: client.to_string(),
            allocation,
            routes: subnets.iter().map(Subnet::route).collect(),
            established_at: Utc::now(),
            source_address: req.source_address.clone(),
            identity,
        };
        let active = self.ctx.state.insert(session.clone()).await;
        plan.commit();
        self.ctx.metrics.set_active_clients(active);

        info!(
            client,
            ip = %session.ip(),
            routes = session.routes.len(),
            "client connected"
        );
        Ok(AuthOutcome::Connected(session))
    }

    /// Credential bundle plus the two-step login. Returns the resolved
    /// identity and the bearer token.
    async fn verify_identity(&self, req: &AuthRequest) -> StageResult<(String, String)> {
        let creds = read_credential_file(req.credential_file.as_deref())
            .await
            .at(Stage::ParseCredentials)?;

        let started = Instant::now();
        let provider = self.identity.as_ref();

        if let Err(e) = validate_two_factor_enabled(provider, &creds).await {
            self.count_rejection(&e);
            return Err((Stage::ValidateTwoFactorEnabled, e));
        }
        let response = match validate_credentials(provider, &creds).await {
            Ok(r) => r,
            Err(e) => {
                self.count_rejection(&e);
                return Err((Stage::ValidateCredentials, e));
            }
        };
        let token = decode_token(&response.body).at(Stage::ObtainToken)?;

        self.ctx.metrics.auth_succeeded(started.elapsed());
        info!(client = %req.client, user = %creds.username, "successfully authenticated client");
        Ok((creds.username, token.token))
    }

    fn count_rejection(&self, e: &GatewayError) {
        match e.kind {
            GatewayErrorKind::TwoFactorNotEnabled | GatewayErrorKind::InvalidCredentials => {
                self.ctx.metrics.auth_failed()
            }
            kind => self.ctx.metrics.error(OP, kind),
        }
    }

    /// Interface, routes, firewall rule, then the client configuration file.
    async fn configure_network(
        &self,
        ip: Ipv4Addr,
        subnets: &[Subnet],
        path: &Path,
        plan: &mut RollbackPlan,
    ) -> GatewayResult<()> {
        let network = self.ctx.network.as_ref();

        network.create_interface(ip).await?;
        plan.push(Compensation::DeleteInterface { ip });

        for subnet in subnets {
            network.add_route(ip, subnet).await?;
        }

        network.enable_client(ip).await?;
        plan.push(Compensation::DisableClient { ip });

        plan.push(Compensation::RemoveClientConfig {
            path: path.to_path_buf(),
        });
        tokio::fs::write(path, render_client_config(ip, subnets))
            .await
            .map_err(|e| GatewayError::io(format!("cannot write {}", path.display()), e))?;
        Ok(())
    }
}
