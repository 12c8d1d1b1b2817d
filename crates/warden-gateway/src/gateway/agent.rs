//! Network and certificate agents.
//!
//! Both are opaque external programs. The gateway only knows their command
//! names and argument shapes; a non-zero exit is an `AgentFailed` error that
//! carries whatever the program printed.

use crate::gateway::types::{GatewayError, GatewayResult, Subnet};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

pub const FW_INIT: &str = "fw-init.sh";
pub const FW_ADD: &str = "fw-add.sh";
pub const FW_DEL: &str = "fw-del.sh";
pub const CLIENT_CREATE: &str = "client-create.sh";
pub const CLIENT_REVOKE: &str = "client-revoke.sh";

/// Per-client tunnel interface, routes and firewall/NAT rules.
///
/// Implementations must tolerate concurrent calls for distinct addresses.
/// `delete_interface` is expected to drop every route bound to it.
#[async_trait]
pub trait NetworkAgent: Send + Sync {
    /// Baseline policy applied once at startup.
    async fn init_policy(&self) -> GatewayResult<()>;
    async fn create_interface(&self, ip: Ipv4Addr) -> GatewayResult<()>;
    async fn add_route(&self, ip: Ipv4Addr, subnet: &Subnet) -> GatewayResult<()>;
    async fn enable_client(&self, ip: Ipv4Addr) -> GatewayResult<()>;
    async fn disable_client(&self, ip: Ipv4Addr) -> GatewayResult<()>;
    async fn delete_interface(&self, ip: Ipv4Addr) -> GatewayResult<()>;
}

/// Client certificate issuance and revocation.
#[async_trait]
pub trait CertificateAgent: Send + Sync {
    async fn issue(&self, client: &str) -> GatewayResult<()>;
    async fn revoke(&self, client: &str, ignore_errors: bool) -> GatewayResult<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Script-backed agent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Captured output of a finished agent command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs the agent scripts from one directory as argument vectors.
#[derive(Debug, Clone)]
pub struct ScriptAgent {
    script_dir: PathBuf,
    /// Address handed to enable/disable so client traffic can reach it.
    gateway_ip: Ipv4Addr,
    /// Run scripts through this program instead of executing them directly.
    interpreter: Option<PathBuf>,
}

impl ScriptAgent {
    pub fn new(script_dir: impl Into<PathBuf>, gateway_ip: Ipv4Addr) -> Self {
        Self {
            script_dir: script_dir.into(),
            gateway_ip,
            interpreter: None,
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    /// Run `script args..` and fail on a non-zero exit.
    pub async fn run(&self, script: &str, args: &[String]) -> GatewayResult<CommandOutput> {
        let path = self.script_dir.join(script);
        let mut cmd = match &self.interpreter {
            Some(interp) => {
                let mut c = Command::new(interp);
                c.arg(&path);
                c
            }
            None => Command::new(&path),
        };
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let rendered = format!("{} {}", script, args.join(" "));
        debug!(command = %rendered, "running agent command");

        let output = cmd.output().await.map_err(|e| {
            GatewayError::agent_failed(format!("cannot run `{}`", rendered))
                .with_detail(format!("{}: {}", path.display(), e))
        })?;

        let out = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".into());
            return Err(GatewayError::agent_failed(format!(
                "`{}` exited with {}",
                rendered, code
            ))
            .with_detail(format!("stdout={:?} stderr={:?}", out.stdout, out.stderr)));
        }
        Ok(out)
    }
}

#[async_trait]
impl NetworkAgent for ScriptAgent {
    async fn init_policy(&self) -> GatewayResult<()> {
        self.run(FW_INIT, &[]).await.map(drop)
    }

    async fn create_interface(&self, ip: Ipv4Addr) -> GatewayResult<()> {
        self.run(FW_ADD, &["create".into(), ip.to_string()])
            .await
            .map(drop)
    }

    async fn add_route(&self, ip: Ipv4Addr, subnet: &Subnet) -> GatewayResult<()> {
        self.run(FW_ADD, &["add".into(), ip.to_string(), subnet.route()])
            .await
            .map(drop)
    }

    async fn enable_client(&self, ip: Ipv4Addr) -> GatewayResult<()> {
        self.run(
            FW_ADD,
            &["enable".into(), ip.to_string(), self.gateway_ip.to_string()],
        )
        .await
        .map(drop)
    }

    async fn disable_client(&self, ip: Ipv4Addr) -> GatewayResult<()> {
        self.run(
            FW_DEL,
            &["disable".into(), ip.to_string(), self.gateway_ip.to_string()],
        )
        .await
        .map(drop)
    }

    async fn delete_interface(&self, ip: Ipv4Addr) -> GatewayResult<()> {
        self.run(FW_DEL, &["delete".into(), ip.to_string()])
            .await
            .map(drop)
    }
}

#[async_trait]
impl CertificateAgent for ScriptAgent {
    async fn issue(&self, client: &str) -> GatewayResult<()> {
        self.run(CLIENT_CREATE, &[format!("--client={}", client)])
            .await
            .map(drop)
    }

    async fn revoke(&self, client: &str, ignore_errors: bool) -> GatewayResult<()> {
        let mut args = Vec::with_capacity(2);
        if ignore_errors {
            args.push("--ignore-errors".to_string());
        }
        args.push(format!("--client={}", client));
        self.run(CLIENT_REVOKE, &args).await.map(drop)
    }
}
