//! Gateway service: the eight RPC operations over shared state.
//!
//! Owns the allocation pool and connection registry, and wires the
//! authentication pipeline, teardown and certificate lifecycle to the
//! external collaborators.

use crate::gateway::agent::{CertificateAgent, NetworkAgent, ScriptAgent};
use crate::gateway::certs::ClientCertificates;
use crate::gateway::config::GatewayConfig;
use crate::gateway::identity::{HttpIdentityProvider, IdentityProvider};
use crate::gateway::inventory::{HttpInventory, Inventory, StaticInventory};
use crate::gateway::metrics::GatewayMetrics;
use crate::gateway::pipeline::{AuthOutcome, AuthRequest, Authenticator};
use crate::gateway::profile::{ProfileBuilder, ProfileTemplate};
use crate::gateway::state::{GatewayContext, GatewayState};
use crate::gateway::teardown::Teardown;
use crate::gateway::types::*;
use std::sync::Arc;
use tracing::info;

/// Shared handle used by the RPC router and the supervisor.
pub type GatewayServiceState = Arc<GatewayService>;

/// External systems the gateway talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub inventory: Arc<dyn Inventory>,
    pub network: Arc<dyn NetworkAgent>,
    pub certificates: Arc<dyn CertificateAgent>,
}

impl Collaborators {
    /// Production wiring: HTTP identity/inventory and the agent scripts.
    /// The testing environment swaps in the static inventory.
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let scripts = Arc::new(ScriptAgent::new(&config.script_dir, config.gateway_ip));
        let inventory: Arc<dyn Inventory> = if config.environment.is_testing() {
            Arc::new(StaticInventory::testing())
        } else {
            Arc::new(HttpInventory::new(
                config.api_host.clone(),
                config.consumer_token.clone(),
            )?)
        };
        Ok(Self {
            identity: Arc::new(HttpIdentityProvider::new(
                &config.api_host,
                config.consumer_token.clone(),
            )?),
            inventory,
            network: scripts.clone(),
            certificates: scripts,
        })
    }
}

pub struct GatewayService {
    ctx: GatewayContext,
    authenticator: Authenticator,
    teardown: Teardown,
    certificates: ClientCertificates,
}

impl GatewayService {
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        Self::with_collaborators(config, Collaborators::from_config(config)?)
    }

    pub fn with_collaborators(config: &GatewayConfig, c: Collaborators) -> GatewayResult<Self> {
        let state = Arc::new(GatewayState::for_block(config.pool_network));
        let ctx = GatewayContext::new(state, c.network, Arc::new(GatewayMetrics::new()?));
        info!(
            pool = %config.pool_network,
            capacity = ctx.state.capacity(),
            environment = ?config.environment,
            "allocation pool ready"
        );

        let authenticator = Authenticator::new(
            ctx.clone(),
            c.identity,
            c.inventory,
            config.client_config_dir.clone(),
            config.environment,
        );
        let profiles = ProfileBuilder::new(
            config.pki_dir.clone(),
            ProfileTemplate {
                remote_host: config.remote_host(),
                remote_port: config.remote_port,
            },
        );
        let certificates =
            ClientCertificates::new(ctx.clone(), c.certificates, profiles, config.ledger_path());

        Ok(Self {
            teardown: Teardown::new(ctx.clone()),
            ctx,
            authenticator,
            certificates,
        })
    }

    pub fn context(&self) -> &GatewayContext {
        &self.ctx
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        self.ctx.metrics.clone()
    }

    // ── Sessions ─────────────────────────────────────────────────

    pub async fn authenticate(&self, req: &AuthRequest) -> GatewayResult<AuthOutcome> {
        self.authenticator.authenticate(req).await
    }

    pub async fn disconnect(&self, client: &str) -> GatewayResult<Session> {
        info!(client, "disconnect request");
        self.teardown.disconnect(client).await
    }

    pub async fn list_connections(&self) -> Vec<Session> {
        self.ctx.state.list_sessions().await
    }

    pub async fn list_allocations(&self, only_allocated: bool) -> Vec<Allocation> {
        self.ctx.state.list_allocations(only_allocated).await
    }

    // ── Certificates ─────────────────────────────────────────────

    pub async fn create_client(&self, client: &str, force: bool) -> GatewayResult<String> {
        self.certificates.create_client(client, force).await
    }

    pub async fn get_client(&self, client: &str) -> GatewayResult<ClientDetails> {
        self.certificates.get_client(client).await
    }

    pub async fn revoke_client(&self, client: &str) -> GatewayResult<()> {
        self.certificates.revoke_client(client).await
    }

    pub async fn list_clients(&self) -> GatewayResult<Vec<CertificateRecord>> {
        self.certificates.list_clients().await
    }
}
