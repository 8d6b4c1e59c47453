//! Flag and environment configuration.
//!
//! Each executable declares one `clap` parser; the argument groups here are
//! flattened into them so that the same setting always reads the same
//! environment variable.

use crate::error::{Error, Result};
use crate::telemetry::LogFormat;
use clap::Args;
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::info;
use workload_identity::{Agent, MaterialWatcher, SpiffeId, TrustDomain, DEFAULT_AGENT_SOCKET};

/// Where and how to reach the local SPIFFE agent.
#[derive(Debug, Clone, Args)]
pub struct AgentArgs {
    /// Workload API endpoint of the local SPIFFE agent.
    #[arg(
        long = "spiffe-endpoint-socket",
        env = "SPIFFE_ENDPOINT_SOCKET",
        default_value = DEFAULT_AGENT_SOCKET
    )]
    pub socket: String,

    /// Seconds to wait for the agent on each call.
    #[arg(
        long = "agent-timeout",
        env = "AGENT_TIMEOUT_SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub timeout_secs: u64,

    /// Federated trust domains whose bundles also verify peers.
    #[arg(
        long = "federated-trust-domains",
        env = "FEDERATED_TRUST_DOMAINS",
        value_delimiter = ',',
        value_parser = parse_trust_domain
    )]
    pub federated: Vec<TrustDomain>,
}

impl AgentArgs {
    /// Connects to the agent.
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be reached within the timeout.
    pub async fn connect(&self) -> Result<Agent> {
        info!(socket = %self.socket, "connecting to SPIFFE agent");
        let agent = Agent::connect(&self.socket, Duration::from_secs(self.timeout_secs)).await?;
        Ok(agent)
    }

    /// Fetches the X.509 SVID and starts following its rotation.
    ///
    /// # Errors
    ///
    /// Fails when the agent has no SVID or bundle for this workload.
    pub async fn x509_watcher(&self, agent: &Agent) -> Result<MaterialWatcher> {
        let watcher = MaterialWatcher::start(agent, self.federated.clone()).await?;
        let current = watcher.current();
        info!(
            spiffe_id = %current.spiffe_id(),
            not_after = current.not_after(),
            "obtained X.509 SVID"
        );
        Ok(watcher)
    }
}

/// Logging options.
#[derive(Debug, Clone, Args)]
pub struct LogArgs {
    /// Log line format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl LogArgs {
    /// Installs the subscriber for the chosen format.
    pub fn init(&self) {
        crate::telemetry::init(self.log_format);
    }
}

/// Address of the ping-pong server a client calls.
///
/// `SERVER_ADDRESS` wins when set; otherwise the URL is assembled from the
/// Kubernetes service variables.
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Full server URL or `host:port`.
    #[arg(long, env = "SERVER_ADDRESS", value_parser = non_empty)]
    pub server_address: Option<String>,

    /// Server host name.
    #[arg(
        long = "ping-pong-service-host",
        env = "PING_PONG_SERVICE_HOST",
        default_value = "ping-pong-server.demo"
    )]
    pub host: String,

    /// Server port.
    #[arg(
        long = "ping-pong-service-port",
        env = "PING_PONG_SERVICE_PORT",
        default_value_t = 8443
    )]
    pub port: u16,
}

impl TargetArgs {
    /// Returns the URL to ping, using `scheme` unless the address names one.
    pub fn url(&self, scheme: &str) -> String {
        match &self.server_address {
            Some(address) if address.contains("://") => address.clone(),
            Some(address) => format!("{scheme}://{address}"),
            None => format!("{scheme}://{}:{}", self.host, self.port),
        }
    }
}

/// Parses a listen address.
///
/// Accepts `":9090"` (port only, all interfaces), a bare port, `ip:port` and
/// `host:port`.
///
/// # Errors
///
/// Returns a message naming the rejected value.
pub fn parse_listen_addr(value: &str) -> std::result::Result<SocketAddr, String> {
    let value = value.trim();
    let port_only = value.strip_prefix(':').unwrap_or(value);

    if let Ok(port) = port_only.parse::<u16>() {
        return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    }

    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }

    value
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| format!("invalid listen address {value:?}"))
}

/// Parses a trust domain name.
///
/// # Errors
///
/// Returns the parser message for invalid names.
pub fn parse_trust_domain(value: &str) -> std::result::Result<TrustDomain, String> {
    TrustDomain::new(value.trim()).map_err(|e| e.to_string())
}

/// Rejects empty values so that `VAR=""` fails like an unset variable.
///
/// # Errors
///
/// Returns a message when the value is empty or whitespace.
pub fn non_empty(value: &str) -> std::result::Result<String, String> {
    if value.trim().is_empty() {
        Err("value must not be empty".to_string())
    } else {
        Ok(value.to_string())
    }
}

/// Reads a switch the way shell scripts set it: `true` in any case turns it
/// on and everything else leaves it off.
///
/// # Errors
///
/// Never fails.
pub fn is_true(value: &str) -> std::result::Result<bool, Infallible> {
    Ok(value.trim().eq_ignore_ascii_case("true"))
}

/// Builds a SPIFFE ID from a template, replacing the first `%s` with
/// `trust_domain`. Templates without `%s` are used as they are.
///
/// # Errors
///
/// Returns [`Error::InvalidSpiffeId`] when the result is not a SPIFFE ID, for
/// example because the trust domain was left empty.
pub fn expand_spiffe_id(template: &str, trust_domain: &str) -> Result<SpiffeId> {
    let id = template.replacen("%s", trust_domain, 1);
    SpiffeId::new(&id).map_err(|e| Error::InvalidSpiffeId {
        reason: e.to_string(),
        id,
    })
}

/// Parses a SPIFFE ID given verbatim.
///
/// # Errors
///
/// Returns [`Error::InvalidSpiffeId`] when `id` does not parse.
pub fn spiffe_id(id: &str) -> Result<SpiffeId> {
    SpiffeId::new(id).map_err(|e| Error::InvalidSpiffeId {
        id: id.to_string(),
        reason: e.to_string(),
    })
}
