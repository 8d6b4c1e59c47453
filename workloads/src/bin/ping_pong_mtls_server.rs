//! Ping-pong server authenticated with X.509-SVIDs.
//!
//! Clients must present an SVID from a trusted bundle; optionally a specific
//! SPIFFE ID or service account. Counters are served on `/debug/vars`. A
//! plaintext listener for comparison can be enabled with `INSECURE_PORT`.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use workload_identity::{authorizer, Authorizer};
use workloads::config::{is_true, parse_listen_addr, spiffe_id, AgentArgs, LogArgs};
use workloads::http::{self, Server};
use workloads::metrics::ServerMetrics;
use workloads::pingpong::{self, PongState};
use workloads::tls;

#[derive(Debug, Parser)]
#[command(name = "ping-pong-mtls-server", version, about)]
struct Cli {
    /// Listen address of the mTLS server.
    #[arg(long, env = "PORT", default_value = ":8443", value_parser = parse_listen_addr)]
    port: SocketAddr,

    /// Only this client SPIFFE ID may connect.
    #[arg(long, env = "AUTHORIZED_CLIENT_ID")]
    authorized_client_id: Option<String>,

    /// Only clients whose ID path contains `sa/<name>` may connect.
    #[arg(long, env = "AUTHORIZED_SERVICE_ACCOUNT")]
    authorized_service_account: Option<String>,

    /// Listen address of an additional plaintext server.
    #[arg(long, env = "INSECURE_PORT", value_parser = parse_listen_addr)]
    insecure_port: Option<SocketAddr>,

    /// Name the server's own SPIFFE ID in every reply.
    #[arg(long, env = "ANNOUNCE_IDENTITY", default_value = "false", value_parser = is_true)]
    announce_identity: bool,

    #[command(flatten)]
    agent: AgentArgs,

    #[command(flatten)]
    log: LogArgs,
}

impl Cli {
    fn authorizer(&self) -> anyhow::Result<Arc<dyn Authorizer>> {
        if let Some(id) = &self.authorized_client_id {
            let id = spiffe_id(id)?;
            info!(%id, "authorizing a single client");
            return Ok(Arc::new(authorizer::exact([id])?));
        }
        if let Some(account) = &self.authorized_service_account {
            info!(service_account = %account, "authorizing a service account");
            return Ok(Arc::new(authorizer::path_segment("sa", account.as_str())));
        }
        Ok(Arc::new(authorizer::any()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.log.init();
    workload_identity::ensure_crypto_provider_installed();

    let metrics = ServerMetrics::new()?;
    let authorizer = cli.authorizer()?;

    let agent = cli.agent.connect().await;
    let watcher = match agent {
        Ok(agent) => cli.agent.x509_watcher(&agent).await,
        Err(e) => Err(e),
    };
    let watcher = watcher.inspect_err(|_| metrics.svid_failures.inc()).context("unable to obtain SVID")?;

    let state = PongState {
        metrics: Arc::clone(&metrics),
        announce: cli
            .announce_identity
            .then(|| watcher.current().spiffe_id().clone()),
    };
    let router = pingpong::mtls_router(state).merge(metrics.router());

    let handshake_metrics = Arc::clone(&metrics);
    let secure = Server::bind(cli.port)
        .await
        .with_context(|| format!("failed to bind {}", cli.port))?
        .with_tls(tls::mtls_acceptor(watcher.clone(), authorizer)?)
        .on_handshake_error(move || handshake_metrics.tls_errors.inc());

    let insecure = match cli.insecure_port {
        Some(addr) => Some(
            Server::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?,
        ),
        None => None,
    };

    let shutdown = CancellationToken::new();
    http::cancel_on_signal(shutdown.clone());

    info!(port = %cli.port, "server starting with metrics at /debug/vars");

    let insecure_shutdown = shutdown.clone();
    let insecure_task = async move {
        match insecure {
            Some(server) => server.serve(pingpong::insecure_router(), insecure_shutdown).await,
            None => Ok(()),
        }
    };

    let (secure_result, insecure_result) =
        tokio::join!(secure.serve(router, shutdown.clone()), insecure_task);

    watcher.shutdown();

    if let Err(e) = &insecure_result {
        error!(error = %e, "insecure server failed");
    }
    secure_result.context("failed to serve")
}
