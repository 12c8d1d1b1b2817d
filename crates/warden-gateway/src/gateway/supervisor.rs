//! Process supervisor for `wardend`.
//!
//! Startup order: allocation pool, baseline firewall policy, VPN daemon,
//! RPC and metrics listeners. Shutdown starts on the first of an OS signal
//! or the daemon exiting on its own; both cancel one shared token. Listeners
//! drain in-flight calls, and [`Supervisor::run`] returns only after the
//! daemon process is gone. [`Supervisor::run_until`] takes the token from
//! the caller instead of installing signal handlers.

use crate::gateway::config::GatewayConfig;
use crate::gateway::service::GatewayService;
use crate::gateway::types::{GatewayError, GatewayErrorKind, GatewayResult};
use axum::Router;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Stderr lines kept for the report on an unexpected daemon exit.
const STDERR_TAIL: usize = 20;
const LINE_BUFFER: usize = 256;
/// Upper bound on waiting for output readers once the daemon has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Supervisor {
    config: GatewayConfig,
}

impl Supervisor {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> GatewayResult<()> {
        let service = Arc::new(GatewayService::from_config(&self.config)?);
        self.run_with(service).await
    }

    /// Run with an already-wired service until an OS signal or daemon exit.
    pub async fn run_with(self, service: Arc<GatewayService>) -> GatewayResult<()> {
        let token = CancellationToken::new();
        let signals = tokio::spawn(watch_signals(token.clone()));
        let result = self.run_until(service, token).await;
        signals.abort();
        result
    }

    /// Run until `token` is cancelled or the daemon exits.
    ///
    /// Cancelling `token` stops accepting connections, lets in-flight calls
    /// finish, and stops the daemon. Returns once both listeners are closed
    /// and the daemon process has exited.
    pub async fn run_until(
        self,
        service: Arc<GatewayService>,
        token: CancellationToken,
    ) -> GatewayResult<()> {
        info!("applying baseline network policy");
        service.context().network.init_policy().await.map_err(|e| {
            error!(error = %e, "baseline network policy failed");
            e
        })?;

        let daemon = tokio::spawn(run_daemon(
            self.config.daemon_command.clone(),
            token.clone(),
        ));

        let listeners = async {
            let rpc = bind(self.config.listen_addr, "rpc").await?;
            let metrics = bind(self.config.metrics_addr(), "metrics").await?;
            Ok::<_, GatewayError>((rpc, metrics))
        }
        .await;

        let servers = match listeners {
            Ok((rpc, metrics)) => vec![
                tokio::spawn(serve(rpc, service.clone().create_router(), "rpc", token.clone())),
                tokio::spawn(serve(
                    metrics,
                    service.metrics().router(),
                    "metrics",
                    token.clone(),
                )),
            ],
            Err(e) => {
                token.cancel();
                let _ = daemon.await;
                return Err(e);
            }
        };

        let result = match daemon.await {
            Ok(r) => r,
            Err(e) => Err(GatewayError::new(
                GatewayErrorKind::Internal,
                "daemon supervision task failed",
            )
            .with_detail(e.to_string())),
        };
        token.cancel();

        for server in servers {
            if let Err(e) = server.await {
                warn!(error = %e, "listener task failed");
            }
        }

        info!(clean = result.is_ok(), "supervisor stopped");
        result
    }
}

async fn bind(addr: SocketAddr, name: &'static str) -> GatewayResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::io(format!("cannot bind {} listener on {}", name, addr), e))
}

async fn serve(
    listener: TcpListener,
    app: Router,
    name: &'static str,
    token: CancellationToken,
) -> GatewayResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(listener = name, address = %addr, "listening");
    }
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .map_err(|e| GatewayError::io(format!("{} listener failed", name), e))?;
    info!(listener = name, "listener stopped");
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Signals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut hup = signal(SignalKind::hangup())?;
    let name = tokio::select! {
        _ = int.recv() => "SIGINT",
        _ = term.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
        _ = hup.recv() => "SIGHUP",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

async fn watch_signals(token: CancellationToken) {
    tokio::select! {
        res = shutdown_signal() => match res {
            Ok(name) => {
                info!(signal = name, "shutdown signal received");
                token.cancel();
            }
            Err(e) => {
                error!(error = %e, "cannot install signal handlers");
                token.cancelled().await;
            }
        },
        _ = token.cancelled() => {}
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Daemon
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

fn read_lines<R>(reader: R, stream: Stream, tx: mpsc::Sender<(Stream, String)>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send((stream, line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(stream = %stream, error = %e, "daemon output read failed");
                    break;
                }
            }
        }
    })
}

/// Log every daemon line and return the last stderr lines.
fn log_lines(mut rx: mpsc::Receiver<(Stream, String)>) -> JoinHandle<VecDeque<String>> {
    tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
        while let Some((stream, line)) = rx.recv().await {
            match stream {
                Stream::Stdout => info!(stream = "stdout", "{}", line),
                Stream::Stderr => {
                    warn!(stream = "stderr", "{}", line);
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        }
        tail
    })
}

/// Run the VPN daemon until it exits or `token` is cancelled.
///
/// A daemon exit cancels `token`. Exit after cancellation is a clean stop;
/// any other exit is a `Daemon` error carrying the stderr tail.
pub async fn run_daemon(command: Vec<String>, token: CancellationToken) -> GatewayResult<()> {
    let (program, args) = command.split_first().ok_or_else(|| {
        GatewayError::new(GatewayErrorKind::Config, "daemon command is empty")
    })?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            token.cancel();
            GatewayError::new(GatewayErrorKind::Daemon, format!("cannot start `{}`", program))
                .with_detail(e.to_string())
        })?;
    info!(command = %command.join(" "), pid = child.id().unwrap_or(0), "vpn daemon started");

    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    let mut readers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        readers.push(read_lines(out, Stream::Stdout, tx.clone()));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(read_lines(err, Stream::Stderr, tx.clone()));
    }
    drop(tx);
    let logger = log_lines(rx);

    let status = tokio::select! {
        status = child.wait() => status,
        _ = token.cancelled() => {
            info!("stopping vpn daemon");
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "daemon already exited");
            }
            child.wait().await
        }
    };
    let cancelled = token.is_cancelled();
    token.cancel();

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        for r in readers {
            let _ = r.await;
        }
        logger.await.unwrap_or_default()
    })
    .await;
    let tail = match drained {
        Ok(tail) => tail,
        Err(_) => {
            warn!("daemon output still open after exit, not waiting further");
            VecDeque::new()
        }
    };

    let status = status.map_err(|e| {
        GatewayError::new(GatewayErrorKind::Daemon, "cannot wait for vpn daemon")
            .with_detail(e.to_string())
    })?;

    if cancelled {
        info!(status = %status, "vpn daemon stopped");
        return Ok(());
    }

    let stderr = Vec::from(tail).join("\n");
    error!(status = %status, stderr = %stderr, "vpn daemon exited unexpectedly");
    let err = GatewayError::new(
        GatewayErrorKind::Daemon,
        format!("vpn daemon exited unexpectedly ({})", status),
    );
    Err(if stderr.is_empty() { err } else { err.with_detail(stderr) })
}
