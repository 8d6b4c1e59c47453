//! Plain ping-pong client: pings the server every five seconds over HTTP or
//! HTTPS without presenting an identity.

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;
use workloads::config::{is_true, LogArgs, TargetArgs};
use workloads::pingpong::{self, PING_PERIOD};
use workloads::{http, tls};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "ping-pong-client", version, about)]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,

    /// Scheme used when the target does not name one.
    #[arg(long, env = "PING_PONG_SCHEME", value_enum, default_value_t = Scheme::Https)]
    scheme: Scheme,

    /// Accept any server certificate. On unless set to something other than
    /// `true`.
    #[arg(long, env = "INSECURE_SKIP_VERIFY", default_value = "true", value_parser = is_true)]
    insecure_skip_verify: bool,

    #[command(flatten)]
    log: LogArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.log.init();
    workload_identity::ensure_crypto_provider_installed();

    let client = tls::http_client(cli.insecure_skip_verify)?;
    let url = cli.target.url(cli.scheme.as_str());
    info!(%url, insecure_skip_verify = cli.insecure_skip_verify, "client starting");

    let shutdown = CancellationToken::new();
    http::cancel_on_signal(shutdown.clone());

    let (client, url) = (&client, url.as_str());
    pingpong::run_every(PING_PERIOD, shutdown, move || async move {
        info!("ping...");
        pingpong::ping(client, url).await.map(drop)
    })
    .await;

    Ok(())
}
