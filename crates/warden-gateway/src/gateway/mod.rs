//! Gateway module root – re-exports public API surface.

pub mod types;
pub mod config;
pub mod credentials;
pub mod ledger;
pub mod state;
pub mod identity;
pub mod inventory;
pub mod agent;
pub mod rollback;
pub mod pipeline;
pub mod teardown;
pub mod profile;
pub mod certs;
pub mod service;
pub mod api;
pub mod metrics;
pub mod supervisor;

pub use types::*;
pub use config::{ConfigError, Environment, GatewayConfig, LogFormat};
pub use service::{GatewayService, GatewayServiceState};
pub use supervisor::Supervisor;
