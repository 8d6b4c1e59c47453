//! Ping-pong client authenticated with X.509-SVIDs, exporting Prometheus
//! metrics about its pings and its current SVID.

use anyhow::Context;
use clap::{ArgAction, Parser};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use workload_identity::{authorizer, Authorizer};
use workloads::config::{parse_listen_addr, spiffe_id, AgentArgs, LogArgs, TargetArgs};
use workloads::http::{self, Server};
use workloads::metrics::{watch_svid_updates, ClientMetrics};
use workloads::pingpong::{self, PING_PERIOD};
use workloads::tls;

#[derive(Debug, Parser)]
#[command(name = "ping-pong-mtls-client", version, about)]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,

    /// Only talk to a server with this SPIFFE ID.
    #[arg(long, env = "SERVER_SPIFFE_ID")]
    server_spiffe_id: Option<String>,

    /// Listen address of the `/metrics` endpoint.
    #[arg(long, env = "METRICS_PORT", default_value = ":8080", value_parser = parse_listen_addr)]
    metrics_port: SocketAddr,

    /// Serve `/metrics`.
    #[arg(long, env = "METRICS_ENABLED", default_value_t = true, action = ArgAction::Set)]
    metrics_enabled: bool,

    #[command(flatten)]
    agent: AgentArgs,

    #[command(flatten)]
    log: LogArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.log.init();
    workload_identity::ensure_crypto_provider_installed();

    let metrics = ClientMetrics::new()?;

    let server_authorizer: Arc<dyn Authorizer> = match &cli.server_spiffe_id {
        Some(id) => Arc::new(authorizer::exact([spiffe_id(id)?])?),
        None => Arc::new(authorizer::any()),
    };

    let agent = cli.agent.connect().await;
    let watcher = match agent {
        Ok(agent) => cli.agent.x509_watcher(&agent).await,
        Err(e) => Err(e),
    };
    let watcher = watcher
        .inspect_err(|_| metrics.svid_failures.inc())
        .context("unable to obtain SVID")?;

    let shutdown = CancellationToken::new();
    http::cancel_on_signal(shutdown.clone());

    if cli.metrics_enabled {
        let server = Server::bind(cli.metrics_port)
            .await
            .with_context(|| format!("failed to bind {}", cli.metrics_port))?;
        let router = metrics.router();
        let metrics_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(router, metrics_shutdown).await {
                error!(error = %e, "metrics server failed");
            }
        });

        tokio::spawn(watch_svid_updates(
            watcher.clone(),
            Arc::clone(&metrics),
            shutdown.clone(),
        ));
    }

    let client = tls::mtls_http_client(watcher.clone(), server_authorizer)?;
    let url = cli.target.url("https");
    info!(%url, metrics_port = %cli.metrics_port, "client starting with metrics at /metrics");

    let (client, url, loop_metrics) = (&client, url.as_str(), &metrics);
    pingpong::run_every(PING_PERIOD, shutdown, move || async move {
        info!("ping...");
        loop_metrics.requests_total.inc();
        match pingpong::ping(client, url).await {
            Ok(_) => {
                loop_metrics.successful_connections.inc();
                Ok(())
            }
            Err(e) => {
                loop_metrics.ping_errors.inc();
                if is_tls_failure(&e) {
                    warn!("TLS handshake with server failed");
                    loop_metrics.tls_errors.inc();
                }
                Err(e)
            }
        }
    })
    .await;

    watcher.shutdown();
    Ok(())
}

// reqwest reports handshake failures as connect errors whose source chain
// ends in a rustls error.
fn is_tls_failure(err: &workloads::Error) -> bool {
    let workloads::Error::Request(request) = err else {
        return false;
    };
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(request);
    while let Some(inner) = source {
        if inner.is::<rustls::Error>() {
            return true;
        }
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            if io.get_ref().is_some_and(|e| e.is::<rustls::Error>()) {
                return true;
            }
        }
        source = inner.source();
    }
    false
}
