//! Compensating actions for a partially applied authentication.
//!
//! Each side effect pushes its inverse onto a [`RollbackPlan`] as soon as it
//! succeeds. On failure the plan is unwound newest-first; on success it is
//! committed and the entries are dropped.

use crate::gateway::agent::NetworkAgent;
use crate::gateway::state::GatewayState;
use crate::gateway::types::{GatewayError, GatewayResult};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Give the client's pool slot back.
    ReleaseAddress { client: String },
    /// Tear down the tunnel interface and every route bound to it.
    DeleteInterface { ip: Ipv4Addr },
    /// Drop the per-client firewall/NAT rule.
    DisableClient { ip: Ipv4Addr },
    /// Remove a (possibly partial) client configuration file.
    RemoveClientConfig { path: PathBuf },
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReleaseAddress { client } => write!(f, "release address of `{}`", client),
            Self::DeleteInterface { ip } => write!(f, "delete interface {}", ip),
            Self::DisableClient { ip } => write!(f, "disable client rule {}", ip),
            Self::RemoveClientConfig { path } => {
                write!(f, "remove client config {}", path.display())
            }
        }
    }
}

/// What compensations act upon.
pub struct Compensator<'a> {
    pub state: &'a GatewayState,
    pub network: &'a dyn NetworkAgent,
}

impl Compensator<'_> {
    async fn apply(&self, step: &Compensation) -> GatewayResult<()> {
        match step {
            Compensation::ReleaseAddress { client } => {
                self.state.release(client).await;
                Ok(())
            }
            Compensation::DeleteInterface { ip } => self.network.delete_interface(*ip).await,
            Compensation::DisableClient { ip } => self.network.disable_client(*ip).await,
            Compensation::RemoveClientConfig { path } => match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(GatewayError::io(
                    format!("cannot remove {}", path.display()),
                    e,
                )),
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct RollbackPlan {
    steps: Vec<Compensation>,
}

impl RollbackPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: Compensation) {
        self.steps.push(step);
    }

    /// Pending compensations in the order they were recorded.
    pub fn steps(&self) -> &[Compensation] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Success: forget every compensation.
    pub fn commit(mut self) {
        self.steps.clear();
    }

    /// Run every compensation newest-first.
    ///
    /// A failing step is logged and skipped; the rest still run. Returns the
    /// errors of the steps that failed.
    pub async fn unwind(self, with: &Compensator<'_>) -> Vec<GatewayError> {
        let mut failures = Vec::new();
        for step in self.steps.into_iter().rev() {
            match with.apply(&step).await {
                Ok(()) => info!(step = %step, "rolled back"),
                Err(e) => {
                    error!(step = %step, error = %e, "rollback step failed");
                    failures.push(e);
                }
            }
        }
        failures
    }
}
