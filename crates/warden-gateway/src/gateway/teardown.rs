//! Session teardown, shared by `Disconnect` and cascading revoke.

use crate::gateway::state::GatewayContext;
use crate::gateway::types::{validate_client_id, GatewayError, GatewayResult, Session};
use tracing::{info, warn};

#[derive(Clone)]
pub struct Teardown {
    ctx: GatewayContext,
}

impl Teardown {
    pub fn new(ctx: GatewayContext) -> Self {
        Self { ctx }
    }

    /// Tear down the client's network state and forget its session.
    ///
    /// Order: disable firewall rule, delete interface, release the address,
    /// remove the session. Fails with `NotConnected` before touching anything
    /// when the client has no session. An agent failure leaves the session
    /// and its address in place so the call can be retried.
    pub async fn disconnect(&self, client: &str) -> GatewayResult<Session> {
        validate_client_id(client)?;
        let _gate = self.ctx.gates.acquire(client).await;

        let session = match self.ctx.state.lookup(client).await {
            Some(s) => s,
            None => return Err(GatewayError::not_connected(client)),
        };
        let ip = session.ip();

        if let Err(e) = self.remove_network(&session).await {
            warn!(client, ip = %ip, error = %e, "teardown failed");
            self.ctx.metrics.error("disconnect", e.kind);
            return Err(e);
        }

        self.ctx.state.release(client).await;
        self.ctx.state.remove(client).await;
        let active = self.ctx.state.session_count().await;
        self.ctx.metrics.set_active_clients(active);

        info!(client, ip = %ip, "client disconnected");
        Ok(session)
    }

    async fn remove_network(&self, session: &Session) -> GatewayResult<()> {
        let ip = session.ip();
        self.ctx.network.disable_client(ip).await?;
        self.ctx.network.delete_interface(ip).await
    }
}
