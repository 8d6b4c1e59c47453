//! Ping-pong client that authenticates with a JWT-SVID bearer token and
//! verifies the token the server sends back.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use workloads::config::{non_empty, spiffe_id, AgentArgs, LogArgs};
use workloads::http;
use workloads::jwt_auth::JwtClient;
use workloads::pingpong::PING_PERIOD;
use workloads::tls;

#[derive(Debug, Parser)]
#[command(name = "ping-pong-jwt-client", version, about)]
struct Cli {
    /// URL of the server.
    #[arg(long, env = "PING_PONG_SERVICE_URL", default_value = "https://ping-pong-server.demo")]
    ping_pong_service_url: String,

    /// SPIFFE ID the server's token must carry.
    #[arg(long, env = "SERVER_SPIFFE_ID", value_parser = non_empty)]
    server_spiffe_id: String,

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

    let expected_server = spiffe_id(&cli.server_spiffe_id)?;

    info!("creating workload client");
    let agent = Arc::new(
        cli.agent
            .connect()
            .await
            .context("failed to create workload client")?,
    );

    let client = JwtClient::new(
        tls::http_client(false)?,
        cli.ping_pong_service_url.as_str(),
        agent.clone(),
        agent,
        expected_server,
    );

    let shutdown = CancellationToken::new();
    http::cancel_on_signal(shutdown.clone());

    loop {
        let token = client.token().await.context("failed to obtain JWT-SVID")?;

        info!("ping...");
        if let Err(e) = client.ping(&token).await {
            error!(error = %e, "problem reaching server");
        }

        tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            () = tokio::time::sleep(PING_PERIOD) => {}
        }
    }
}
