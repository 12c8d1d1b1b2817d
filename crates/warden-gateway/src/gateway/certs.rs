//! Client certificate lifecycle: create, revoke, inspect.

use crate::gateway::agent::CertificateAgent;
use crate::gateway::ledger::{find_client, read_ledger};
use crate::gateway::profile::ProfileBuilder;
use crate::gateway::state::GatewayContext;
use crate::gateway::teardown::Teardown;
use crate::gateway::types::{
    validate_client_id, CertificateRecord, ClientDetails, GatewayError, GatewayErrorKind,
    GatewayResult, SERVER_IDENTITY,
};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ClientCertificates {
    ctx: GatewayContext,
    agent: Arc<dyn CertificateAgent>,
    profiles: ProfileBuilder,
    ledger_path: PathBuf,
    teardown: Teardown,
}

impl ClientCertificates {
    pub fn new(
        ctx: GatewayContext,
        agent: Arc<dyn CertificateAgent>,
        profiles: ProfileBuilder,
        ledger_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            teardown: Teardown::new(ctx.clone()),
            ctx,
            agent,
            profiles,
            ledger_path: ledger_path.into(),
        }
    }

    /// Issue a certificate and return the rendered client profile.
    ///
    /// With `force`, any previous certificate is revoked first and revoke
    /// errors are ignored.
    pub async fn create_client(&self, client: &str, force: bool) -> GatewayResult<String> {
        validate_client_id(client)?;
        info!(client, force, "create client request");
        if client == SERVER_IDENTITY {
            self.ctx
                .metrics
                .error("create_client", GatewayErrorKind::ReservedIdentity);
            return Err(GatewayError::reserved_identity("create"));
        }

        if force {
            if let Err(e) = self.agent.revoke(client, true).await {
                debug!(client, error = %e, "ignoring revoke failure before re-issue");
            }
        }

        if let Err(e) = self.agent.issue(client).await {
            warn!(client, error = %e, "certificate issuance failed");
            self.ctx.metrics.error("create_client", e.kind);
            return Err(e);
        }

        self.profiles.build(client).await
    }

    /// Revoke the client's certificate and, if it is connected, tear its
    /// session down before returning.
    pub async fn revoke_client(&self, client: &str) -> GatewayResult<()> {
        validate_client_id(client)?;
        info!(client, "revoke client request");
        if client == SERVER_IDENTITY {
            self.ctx
                .metrics
                .error("revoke_client", GatewayErrorKind::ReservedIdentity);
            return Err(GatewayError::reserved_identity("revoke"));
        }

        if let Err(e) = self.agent.revoke(client, false).await {
            warn!(client, error = %e, "certificate revocation failed");
            self.ctx.metrics.error("revoke_client", e.kind);
            return Err(e);
        }

        if self.ctx.state.lookup(client).await.is_none() {
            info!(client, "client not connected, revocation complete");
            return Ok(());
        }

        info!(client, "revoked client is connected, closing session");
        match self.teardown.disconnect(client).await {
            Ok(_) => Ok(()),
            // disconnected concurrently between lookup and teardown
            Err(e) if e.kind == GatewayErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn get_client(&self, client: &str) -> GatewayResult<ClientDetails> {
        validate_client_id(client)?;
        let records = read_ledger(&self.ledger_path, Utc::now()).await?;
        let record = find_client(&records, client)?;
        // Revoked clients may have had their PKI files moved aside.
        let config = match self.profiles.build(client).await {
            Ok(config) => config,
            Err(e) => {
                warn!(client, status = ?record.status, error = %e, "client profile unavailable");
                String::new()
            }
        };
        Ok(ClientDetails {
            status: record.status,
            expires_at: record.expires_at,
            revoked_at: record.revoked_at,
            config,
        })
    }

    pub async fn list_clients(&self) -> GatewayResult<Vec<CertificateRecord>> {
        read_ledger(&self.ledger_path, Utc::now()).await
    }
}
