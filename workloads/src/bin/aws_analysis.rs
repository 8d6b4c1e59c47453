//! Analysis workload of the AWS demo: asks the consumer for its buckets every
//! five seconds and exits on the first failure.

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use workload_identity::authorizer;
use workloads::aws;
use workloads::config::{expand_spiffe_id, is_true, non_empty, AgentArgs, LogArgs};
use workloads::http;
use workloads::pingpong::{try_run_every, PING_PERIOD};
use workloads::tls;

#[derive(Debug, Parser)]
#[command(name = "aws-analysis", version, about)]
struct Cli {
    /// Base URL of the consumer.
    #[arg(long, env = "CONSUMER_SERVER_ADDRESS", value_parser = non_empty)]
    consumer_server_address: String,

    /// Call the consumer over SVID mTLS.
    #[arg(long, env = "ENABLE_TLS", default_value = "false", value_parser = is_true)]
    enable_tls: bool,

    /// SPIFFE ID template of the consumer; `%s` is the trust domain.
    #[arg(long, env = "CONSUMER_SPIFFE_ID", default_value = "spiffe://%s/ns/production/sa/default")]
    consumer_spiffe_id: String,

    /// Trust domain of the consumer.
    #[arg(long, env = "CONSUMER_TRUST_DOMAIN", default_value = "")]
    consumer_trust_domain: String,

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

    let mut watcher = None;
    let client = if cli.enable_tls {
        let allowed = expand_spiffe_id(&cli.consumer_spiffe_id, &cli.consumer_trust_domain)?;

        info!("waiting for X.509 SVID");
        let agent = cli.agent.connect().await?;
        let svids = cli
            .agent
            .x509_watcher(&agent)
            .await
            .context("unable to create X509Source")?;
        info!("retrieved X.509 SVID");

        let client = tls::mtls_http_client(svids.clone(), authorizer::exact([allowed])?)?;
        watcher = Some(svids);
        client
    } else {
        tls::http_client(false)?
    };

    let shutdown = CancellationToken::new();
    http::cancel_on_signal(shutdown.clone());

    let (client, address) = (&client, cli.consumer_server_address.trim_end_matches('/'));
    let result = try_run_every(PING_PERIOD, shutdown, move || async move {
        aws::fetch_buckets(client, address).await.map(drop)
    })
    .await;

    if let Some(watcher) = watcher {
        watcher.shutdown();
    }
    Ok(result?)
}
