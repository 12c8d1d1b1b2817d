//! Environment-driven gateway configuration.
//!
//! Everything is read once at startup. Missing required variables and
//! unparseable values are fatal; the daemon refuses to start rather than
//! run half-configured.

use crate::gateway::types::{GatewayError, GatewayErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

pub const ENV_API_HOST: &str = "WARDEN_API_HOST";
pub const ENV_CONSUMER_TOKEN: &str = "WARDEN_CONSUMER_TOKEN";
pub const ENV_GATEWAY_IP: &str = "WARDEN_GATEWAY_IP";
pub const ENV_FACILITY: &str = "WARDEN_FACILITY";
pub const ENV_METRICS_PORT: &str = "WARDEN_METRICS_PORT";
pub const ENV_LISTEN_ADDR: &str = "WARDEN_LISTEN_ADDR";
pub const ENV_ENVIRONMENT: &str = "WARDEN_ENVIRONMENT";
pub const ENV_POOL_CIDR: &str = "WARDEN_POOL_CIDR";
pub const ENV_CLIENT_CONFIG_DIR: &str = "WARDEN_CLIENT_CONFIG_DIR";
pub const ENV_PKI_DIR: &str = "WARDEN_PKI_DIR";
pub const ENV_SCRIPT_DIR: &str = "WARDEN_SCRIPT_DIR";
pub const ENV_DAEMON_COMMAND: &str = "WARDEN_DAEMON_COMMAND";
pub const ENV_REMOTE_DOMAIN: &str = "WARDEN_REMOTE_DOMAIN";
pub const ENV_REMOTE_PORT: &str = "WARDEN_REMOTE_PORT";
pub const ENV_LOG_FORMAT: &str = "WARDEN_LOG_FORMAT";

const DEFAULT_METRICS_PORT: u16 = 9090;
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_POOL_CIDR: &str = "192.168.127.0/24";
const DEFAULT_CLIENT_CONFIG_DIR: &str = "/etc/openvpn/ccd";
const DEFAULT_PKI_DIR: &str = "/etc/openvpn/easy-rsa/pki";
const DEFAULT_SCRIPT_DIR: &str = "/app";
const DEFAULT_DAEMON_COMMAND: &str = "/usr/sbin/openvpn --config /etc/openvpn/server.conf";
const DEFAULT_REMOTE_DOMAIN: &str = "vpn.example.net";
const DEFAULT_REMOTE_PORT: u16 = 1194;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for GatewayError {
    fn from(e: ConfigError) -> Self {
        GatewayError::new(GatewayErrorKind::Config, e.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Production,
    /// Skips identity checks and serves a fixed subnet.
    Testing,
}

impl Environment {
    pub fn is_testing(&self) -> bool {
        matches!(self, Self::Testing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  GatewayConfig
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct GatewayConfig {
    pub api_host: Url,
    pub consumer_token: String,
    /// Magic address handed to the firewall enable/disable agent calls.
    pub gateway_ip: Ipv4Addr,
    pub facility: String,
    pub metrics_port: u16,
    pub listen_addr: SocketAddr,
    pub environment: Environment,
    /// Network address of the private /24 the pool is carved from.
    pub pool_network: Ipv4Addr,
    pub client_config_dir: PathBuf,
    pub pki_dir: PathBuf,
    pub script_dir: PathBuf,
    /// Program followed by its arguments.
    pub daemon_command: Vec<String>,
    pub remote_domain: String,
    pub remote_port: u16,
    pub log_format: LogFormat,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("api_host", &self.api_host.as_str())
            .field("consumer_token", &"********")
            .field("gateway_ip", &self.gateway_ip)
            .field("facility", &self.facility)
            .field("metrics_port", &self.metrics_port)
            .field("listen_addr", &self.listen_addr)
            .field("environment", &self.environment)
            .field("pool_network", &self.pool_network)
            .field("client_config_dir", &self.client_config_dir)
            .field("pki_dir", &self.pki_dir)
            .field("script_dir", &self.script_dir)
            .field("daemon_command", &self.daemon_command)
            .field("remote_domain", &self.remote_domain)
            .field("remote_port", &self.remote_port)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl GatewayConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let api_host_raw = required(ENV_API_HOST)?;
        let api_host = Url::parse(&api_host_raw)
            .map_err(|e| ConfigError::invalid(ENV_API_HOST, &api_host_raw, e.to_string()))?;

        let consumer_token = required(ENV_CONSUMER_TOKEN)?;

        let gateway_raw = required(ENV_GATEWAY_IP)?;
        let gateway_ip: Ipv4Addr = gateway_raw
            .parse()
            .map_err(|_| ConfigError::invalid(ENV_GATEWAY_IP, &gateway_raw, "not an IPv4 address"))?;

        let facility = required(ENV_FACILITY)?;

        let metrics_port = match get(ENV_METRICS_PORT) {
            Some(v) => parse_port(ENV_METRICS_PORT, &v)?,
            None => DEFAULT_METRICS_PORT,
        };

        let listen_raw = get(ENV_LISTEN_ADDR).unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr: SocketAddr = listen_raw
            .parse()
            .map_err(|_| ConfigError::invalid(ENV_LISTEN_ADDR, &listen_raw, "not a socket address"))?;

        let environment = match get(ENV_ENVIRONMENT).as_deref() {
            None | Some("production") => Environment::Production,
            Some("testing") => Environment::Testing,
            Some(other) => {
                return Err(ConfigError::invalid(
                    ENV_ENVIRONMENT,
                    other,
                    "expected `production` or `testing`",
                ))
            }
        };

        let pool_raw = get(ENV_POOL_CIDR).unwrap_or_else(|| DEFAULT_POOL_CIDR.to_string());
        let pool_network = parse_pool_block(&pool_raw)?;

        let daemon_raw =
            get(ENV_DAEMON_COMMAND).unwrap_or_else(|| DEFAULT_DAEMON_COMMAND.to_string());
        let daemon_command: Vec<String> =
            daemon_raw.split_whitespace().map(str::to_string).collect();
        if daemon_command.is_empty() {
            return Err(ConfigError::invalid(ENV_DAEMON_COMMAND, &daemon_raw, "empty command"));
        }
        // Split on whitespace only, so quoted arguments would arrive mangled.
        if daemon_raw.contains(['"', '\'']) {
            return Err(ConfigError::invalid(
                ENV_DAEMON_COMMAND,
                &daemon_raw,
                "quoting is not supported; arguments are split on whitespace",
            ));
        }

        let remote_port = match get(ENV_REMOTE_PORT) {
            Some(v) => parse_port(ENV_REMOTE_PORT, &v)?,
            None => DEFAULT_REMOTE_PORT,
        };

        let log_format = match get(ENV_LOG_FORMAT).as_deref() {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::invalid(
                    ENV_LOG_FORMAT,
                    other,
                    "expected `json` or `pretty`",
                ))
            }
        };

        Ok(Self {
            api_host,
            consumer_token,
            gateway_ip,
            facility,
            metrics_port,
            listen_addr,
            environment,
            pool_network,
            client_config_dir: PathBuf::from(
                get(ENV_CLIENT_CONFIG_DIR).unwrap_or_else(|| DEFAULT_CLIENT_CONFIG_DIR.into()),
            ),
            pki_dir: PathBuf::from(get(ENV_PKI_DIR).unwrap_or_else(|| DEFAULT_PKI_DIR.into())),
            script_dir: PathBuf::from(
                get(ENV_SCRIPT_DIR).unwrap_or_else(|| DEFAULT_SCRIPT_DIR.into()),
            ),
            daemon_command,
            remote_domain: get(ENV_REMOTE_DOMAIN)
                .unwrap_or_else(|| DEFAULT_REMOTE_DOMAIN.into()),
            remote_port,
            log_format,
        })
    }

    /// Host name written into client profiles.
    pub fn remote_host(&self) -> String {
        format!("{}.{}", self.facility, self.remote_domain)
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr.ip(), self.metrics_port)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.pki_dir.join("index.txt")
    }
}

fn parse_port(var: &'static str, raw: &str) -> Result<u16, ConfigError> {
    match raw.parse::<u16>() {
        Ok(0) | Err(_) => Err(ConfigError::invalid(var, raw, "not a port number")),
        Ok(p) => Ok(p),
    }
}

/// Parse `a.b.c.0/24`, requiring a private block with no host bits set.
fn parse_pool_block(raw: &str) -> Result<Ipv4Addr, ConfigError> {
    let (addr, prefix) = raw
        .split_once('/')
        .ok_or_else(|| ConfigError::invalid(ENV_POOL_CIDR, raw, "expected CIDR notation"))?;
    let network: Ipv4Addr = addr
        .parse()
        .map_err(|_| ConfigError::invalid(ENV_POOL_CIDR, raw, "not an IPv4 network"))?;
    if prefix != "24" {
        return Err(ConfigError::invalid(ENV_POOL_CIDR, raw, "pool must be a /24"));
    }
    if network.octets()[3] != 0 {
        return Err(ConfigError::invalid(ENV_POOL_CIDR, raw, "host bits set"));
    }
    if !network.is_private() {
        return Err(ConfigError::invalid(ENV_POOL_CIDR, raw, "not a private block"));
    }
    Ok(network)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            (ENV_API_HOST, "https://api.example.net"),
            (ENV_CONSUMER_TOKEN, "consumer"),
            (ENV_GATEWAY_IP, "10.0.0.1"),
            (ENV_FACILITY, "ams1"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<GatewayConfig, ConfigError> {
        GatewayConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_applied() {
        let cfg = load(&base()).unwrap();
        assert_eq!(cfg.metrics_port, 9090);
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.environment, Environment::Production);
        assert_eq!(cfg.pool_network, Ipv4Addr::new(192, 168, 127, 0));
        assert_eq!(cfg.daemon_command[0], "/usr/sbin/openvpn");
        assert_eq!(cfg.remote_host(), "ams1.vpn.example.net");
        assert_eq!(cfg.log_format, LogFormat::Pretty);
        assert_eq!(
            cfg.ledger_path(),
            PathBuf::from("/etc/openvpn/easy-rsa/pki/index.txt")
        );
    }

    #[test]
    fn missing_required_is_fatal() {
        for key in [ENV_API_HOST, ENV_CONSUMER_TOKEN, ENV_GATEWAY_IP, ENV_FACILITY] {
            let mut vars = base();
            vars.remove(key);
            assert_eq!(load(&vars).unwrap_err(), ConfigError::Missing(key));
        }
    }

    #[test]
    fn blank_required_counts_as_missing() {
        let mut vars = base();
        vars.insert(ENV_FACILITY, "  ");
        assert_eq!(load(&vars).unwrap_err(), ConfigError::Missing(ENV_FACILITY));
    }

    #[test]
    fn rejects_bad_values() {
        let cases = [
            (ENV_GATEWAY_IP, "not-an-ip"),
            (ENV_METRICS_PORT, "70000"),
            (ENV_POOL_CIDR, "8.8.8.0/24"),
            (ENV_POOL_CIDR, "10.0.0.0/16"),
            (ENV_POOL_CIDR, "10.0.0.5/24"),
            (ENV_ENVIRONMENT, "staging"),
            (ENV_LOG_FORMAT, "xml"),
        ];
        for (key, value) in cases {
            let mut vars = base();
            vars.insert(key, value);
            assert!(
                matches!(load(&vars), Err(ConfigError::Invalid { var, .. }) if var == key),
                "{key}={value}"
            );
        }
    }

    #[test]
    fn testing_environment_and_json_logs() {
        let mut vars = base();
        vars.insert(ENV_ENVIRONMENT, "testing");
        vars.insert(ENV_LOG_FORMAT, "json");
        vars.insert(ENV_POOL_CIDR, "10.20.30.0/24");
        let cfg = load(&vars).unwrap();
        assert!(cfg.environment.is_testing());
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.pool_network, Ipv4Addr::new(10, 20, 30, 0));
    }

    #[test]
    fn daemon_command_splits_on_whitespace() {
        let mut vars = base();
        vars.insert(ENV_DAEMON_COMMAND, "  /usr/sbin/openvpn   --config /tmp/s.conf ");
        let cfg = load(&vars).unwrap();
        assert_eq!(
            cfg.daemon_command,
            vec!["/usr/sbin/openvpn", "--config", "/tmp/s.conf"]
        );

        for quoted in [r#"/bin/sh -c "exec openvpn""#, "/bin/sh -c 'exit 4'"] {
            vars.insert(ENV_DAEMON_COMMAND, quoted);
            match load(&vars) {
                Err(ConfigError::Invalid { var, reason, .. }) => {
                    assert_eq!(var, ENV_DAEMON_COMMAND);
                    assert!(reason.contains("quoting is not supported"));
                }
                other => panic!("{quoted}: {other:?}"),
            }
        }
    }

    #[test]
    fn debug_redacts_token() {
        let cfg = load(&base()).unwrap();
        let dbg = format!("{:?}", cfg);
        assert!(!dbg.contains("consumer\""));
        assert!(dbg.contains("********"));
    }

    #[test]
    fn config_error_converts() {
        let e: GatewayError = ConfigError::Missing(ENV_FACILITY).into();
        assert_eq!(e.kind, GatewayErrorKind::Config);
        assert!(e.message.contains(ENV_FACILITY));
    }
}
