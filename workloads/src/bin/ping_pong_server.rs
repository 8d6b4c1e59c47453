//! Plain ping-pong server. Serves TLS from mounted certificate files when both
//! exist, plain HTTP otherwise.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use workload_identity::TlsAcceptor;
use workloads::config::{parse_listen_addr, LogArgs};
use workloads::http::{self, Server};
use workloads::{pingpong, tls};

#[derive(Debug, Parser)]
#[command(name = "ping-pong-server", version, about)]
struct Cli {
    /// Listen address.
    #[arg(long, env = "PORT", default_value = ":9090", value_parser = parse_listen_addr)]
    port: SocketAddr,

    /// PEM certificate chain for TLS.
    #[arg(long, env = "TLS_CERT_PATH", default_value = "/etc/certs/tls.crt")]
    tls_cert_path: PathBuf,

    /// PEM private key for TLS.
    #[arg(long, env = "TLS_KEY_PATH", default_value = "/etc/certs/tls.key")]
    tls_key_path: PathBuf,

    #[command(flatten)]
    log: LogArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.log.init();
    workload_identity::ensure_crypto_provider_installed();

    let mut server = Server::bind(cli.port)
        .await
        .with_context(|| format!("failed to bind {}", cli.port))?;

    if tls::files_exist(&cli.tls_cert_path, &cli.tls_key_path) {
        info!(
            cert = %cli.tls_cert_path.display(),
            key = %cli.tls_key_path.display(),
            "TLS enabled"
        );
        let config = tls::server_config_from_pem(&cli.tls_cert_path, &cli.tls_key_path)?;
        server = server.with_tls(TlsAcceptor::new(Arc::new(config)));
    } else {
        info!(
            cert = %cli.tls_cert_path.display(),
            key = %cli.tls_key_path.display(),
            "TLS disabled: cert or key not found"
        );
    }

    let shutdown = CancellationToken::new();
    http::cancel_on_signal(shutdown.clone());

    server
        .serve(pingpong::router(), shutdown)
        .await
        .context("failed to serve")
}
