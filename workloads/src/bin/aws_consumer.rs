//! Consumer workload of the AWS demo: lists S3 buckets using credentials
//! obtained with its JWT-SVID. With `ENABLE_TLS=true` only the analysis
//! workload may call it, over SVID mTLS.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use workload_identity::{authorizer, MaterialWatcher};
use workloads::aws::{self, S3Buckets, DEFAULT_REGION};
use workloads::config::{expand_spiffe_id, is_true, non_empty, parse_listen_addr, AgentArgs, LogArgs};
use workloads::http::{self, Server};
use workloads::tls;

#[derive(Debug, Parser)]
#[command(name = "aws-consumer", version, about)]
struct Cli {
    /// Listen address.
    #[arg(long, env = "PORT", default_value = ":9090", value_parser = parse_listen_addr)]
    port: SocketAddr,

    /// Serve over SVID mTLS.
    #[arg(long, env = "ENABLE_TLS", default_value = "false", value_parser = is_true)]
    enable_tls: bool,

    /// SPIFFE ID template of the analysis workload; `%s` is the trust domain.
    #[arg(long, env = "ANALYSIS_SPIFFE_ID", default_value = "spiffe://%s/ns/analytics/sa/default")]
    analysis_spiffe_id: String,

    /// Trust domain of the analysis workload.
    #[arg(long, env = "ANALYSIS_TRUST_DOMAIN", default_value = "")]
    analysis_trust_domain: String,

    /// Role assumed with the JWT-SVID.
    #[arg(long, env = "AWS_ROLE_ARN", value_parser = non_empty)]
    aws_role_arn: Option<String>,

    /// AWS region.
    #[arg(long, env = "AWS_REGION", default_value = DEFAULT_REGION)]
    aws_region: String,

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

    let agent = Arc::new(
        cli.agent
            .connect()
            .await
            .context("unable to connect to the workload API")?,
    );

    let sdk_config = aws::load_config(cli.aws_region.clone()).await;
    let s3 = match &cli.aws_role_arn {
        Some(role_arn) => Some(aws::s3_client(&sdk_config, agent.clone(), role_arn)),
        None => {
            warn!("AWS_ROLE_ARN is not set; bucket listings will fail");
            None
        }
    };
    let router = aws::consumer_router(Arc::new(S3Buckets::new(s3)));

    let mut server = Server::bind(cli.port)
        .await
        .with_context(|| format!("failed to bind {}", cli.port))?;

    let mut watcher: Option<MaterialWatcher> = None;
    if cli.enable_tls {
        let allowed = expand_spiffe_id(&cli.analysis_spiffe_id, &cli.analysis_trust_domain)?;
        info!(%allowed, "accepting the analysis workload only");

        let svids = cli
            .agent
            .x509_watcher(&agent)
            .await
            .context("unable to create X509Source")?;
        server = server.with_tls(tls::mtls_acceptor(svids.clone(), authorizer::exact([allowed])?)?);
        watcher = Some(svids);
    }

    let shutdown = CancellationToken::new();
    http::cancel_on_signal(shutdown.clone());

    let result = server.serve(router, shutdown).await.context("failed to serve");

    if let Some(watcher) = watcher {
        watcher.shutdown();
    }
    result
}
