//! Ping-pong server that authenticates clients by JWT-SVID bearer token and
//! answers with its own JWT-SVID.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use workloads::config::{non_empty, parse_listen_addr, spiffe_id, AgentArgs, LogArgs};
use workloads::http::{self, Server};
use workloads::jwt_auth;

#[derive(Debug, Parser)]
#[command(name = "ping-pong-jwt-server", version, about)]
struct Cli {
    /// Listen address.
    #[arg(
        long = "listen-address",
        env = "PING_PONG_SERVER_LISTEN_ADDRESS",
        default_value = ":8443",
        value_parser = parse_listen_addr
    )]
    listen_address: SocketAddr,

    /// The only client SPIFFE ID allowed to ping.
    #[arg(long, env = "CLIENT_SPIFFE_ID", value_parser = non_empty)]
    client_spiffe_id: String,

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

    let authorized_client = spiffe_id(&cli.client_spiffe_id)?;

    info!("creating workload client");
    let agent = Arc::new(
        cli.agent
            .connect()
            .await
            .context("failed to create workload client")?,
    );
    info!("created workload client");

    let router = jwt_auth::server_router(agent.clone(), agent, authorized_client);

    let server = Server::bind(cli.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen_address))?;

    let shutdown = CancellationToken::new();
    http::cancel_on_signal(shutdown.clone());

    info!("server starting");
    server.serve(router, shutdown).await.context("failed to serve")
}
