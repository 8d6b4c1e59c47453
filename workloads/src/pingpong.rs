//! The ping-pong exchange: fixed replies on the server side and a flat
//! periodic loop on the client side.

use crate::error::{Error, Result};
use crate::metrics::ServerMetrics;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Router};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use workload_identity::{PeerIdentity, SpiffeId};

/// Reply of the plain servers.
pub const PONG: &str = "...pong";

/// Reply of the plaintext listener next to an mTLS server.
pub const INSECURE_PONG: &str = "...pong from insecure server";

/// Period of every client loop.
pub const PING_PERIOD: Duration = Duration::from_secs(5);

/// Reply of a server that announces its own identity.
pub fn pong_from(id: &SpiffeId) -> String {
    format!("{PONG} from {id}")
}

fn text(body: impl Into<String>) -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], body.into()).into_response()
}

/// Answers every request, whatever its method or path, with [`PONG`].
pub fn router() -> Router {
    Router::new().fallback(|| async { text(PONG) })
}

/// Answers every request with [`INSECURE_PONG`].
pub fn insecure_router() -> Router {
    Router::new().fallback(|| async { text(INSECURE_PONG) })
}

/// Reply settings of the mTLS server.
#[derive(Debug, Clone)]
pub struct PongState {
    /// Counters updated on every request.
    pub metrics: Arc<ServerMetrics>,
    /// When set, replies name this identity.
    pub announce: Option<SpiffeId>,
}

/// Catch-all for the mTLS server: counts the request, logs the caller and
/// replies with [`PONG`] or [`pong_from`].
///
/// Only a fallback is installed, so routes merged in next to it (such as
/// `/debug/vars`) keep precedence.
pub fn mtls_router(state: PongState) -> Router {
    Router::new().fallback(mtls_pong).with_state(state)
}

async fn mtls_pong(
    State(state): State<PongState>,
    Extension(peer): Extension<PeerIdentity>,
) -> Response {
    state.metrics.requests_total.inc();
    state.metrics.successful_connections.inc();

    if let Some(id) = peer.spiffe_id() {
        info!(id = %id, "received ping from client");
    }

    match &state.announce {
        Some(own) => text(pong_from(own)),
        None => text(PONG),
    }
}

/// GETs `url` and logs the body.
///
/// The body is returned for callers that need it; the status code is not
/// checked.
///
/// # Errors
///
/// Fails if the request cannot be sent or the body cannot be read.
pub async fn ping(client: &reqwest::Client, url: &str) -> Result<String> {
    let response = client.get(url).send().await?;
    let body = response.text().await?;
    info!("{body}");
    Ok(body)
}

/// Runs `tick` now and then every `period` until `shutdown` fires.
///
/// Errors are logged as `problem reaching server` and the loop carries on.
pub async fn run_every<F, Fut>(period: Duration, shutdown: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        if let Err(e) = tick().await {
            error!(error = %e, "problem reaching server");
        }

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(period) => {}
        }
    }
}

/// Like [`run_every`] but returns the first error.
///
/// # Errors
///
/// Whatever `tick` returns first.
pub async fn try_run_every<F, Fut>(
    period: Duration,
    shutdown: CancellationToken,
    mut tick: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        tick().await?;

        tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            () = tokio::time::sleep(period) => {}
        }
    }
}

/// Fails with the body unless the response status is `200 OK`.
///
/// # Errors
///
/// [`Error::UnexpectedStatus`] for any other status; transport errors while
/// reading the body.
pub async fn ok_body(response: reqwest::Response) -> Result<String> {
    let status = response.status();
    let body = response.text().await?;
    if status != reqwest::StatusCode::OK {
        return Err(Error::UnexpectedStatus {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}
