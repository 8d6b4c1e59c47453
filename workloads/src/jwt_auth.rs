//! Ping-pong authenticated with JWT-SVID bearer tokens in both directions.
//!
//! The client sends its token for audience [`SERVER_AUDIENCE`]; the server
//! validates it through its agent, checks the subject and answers with its
//! own token for [`CLIENT_AUDIENCE`], which the client validates in turn.

use crate::error::{Error, Result};
use crate::pingpong::{self, PONG};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};
use workload_identity::{bearer_token, JwtToken, SpiffeId, TokenSource, TokenValidator};

/// Audience of tokens sent to the server.
pub const SERVER_AUDIENCE: &str = "ping-pong-server";

/// Audience of tokens sent back to the client.
pub const CLIENT_AUDIENCE: &str = "ping-pong-client";

/// A cached token is replaced once less than this much lifetime remains.
pub const REFRESH_WINDOW: Duration = Duration::from_secs(60);

/// Keeps one JWT-SVID for an audience and refetches it near expiry.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    audience: String,
    current: Mutex<Option<JwtToken>>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

impl TokenCache {
    /// Creates an empty cache; the first [`TokenCache::get`] fetches.
    pub fn new(source: Arc<dyn TokenSource>, audience: impl Into<String>) -> Self {
        Self {
            source,
            audience: audience.into(),
            current: Mutex::new(None),
        }
    }

    /// Returns a token with at least [`REFRESH_WINDOW`] left.
    ///
    /// # Errors
    ///
    /// Fails when a fetch is needed and the source fails.
    pub async fn get(&self) -> Result<JwtToken> {
        let mut current = self.current.lock().await;

        if let Some(token) = current.as_ref().filter(|t| !t.expires_within(REFRESH_WINDOW)) {
            return Ok(token.clone());
        }

        info!(audience = %self.audience, "fetching JWT-SVID");
        let token = self.source.fetch_token(&self.audience).await?;
        info!(audience = %self.audience, "fetched JWT-SVID");

        *current = Some(token.clone());
        Ok(token)
    }
}

#[derive(Clone)]
struct ServerState {
    validator: Arc<dyn TokenValidator>,
    own_token: Arc<TokenCache>,
    authorized_client: SpiffeId,
}

/// The JWT ping-pong server; every method and path goes to the same handler.
///
/// Requests are answered with 401 unless they carry a bearer token that the
/// agent accepts for [`SERVER_AUDIENCE`] and whose subject is
/// `authorized_client`.
pub fn server_router(
    validator: Arc<dyn TokenValidator>,
    source: Arc<dyn TokenSource>,
    authorized_client: SpiffeId,
) -> Router {
    let state = ServerState {
        validator,
        own_token: Arc::new(TokenCache::new(source, CLIENT_AUDIENCE)),
        authorized_client,
    };
    Router::new().fallback(pong).with_state(state)
}

fn unauthorized(message: impl Into<String>) -> Response {
    (StatusCode::UNAUTHORIZED, message.into()).into_response()
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
}

async fn pong(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    let Some(token) = authorization(&headers) else {
        return unauthorized("No token provided by client");
    };

    let client_id = match state.validator.validate(token, SERVER_AUDIENCE).await {
        Ok(id) => id,
        Err(e) => return unauthorized(format!("Invalid client token provided{e}")),
    };

    info!(id = %client_id, "received ping from client");

    if client_id != state.authorized_client {
        info!(id = %client_id, "rejected unauthorized request");
        return unauthorized("Invalid client ID");
    }

    let own = match state.own_token.get().await {
        Ok(token) => token,
        Err(e) => {
            error!(error = %e, "failed to obtain server JWT-SVID");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to get server identity").into_response();
        }
    };

    (
        [
            (header::CONTENT_TYPE, "text/plain".to_string()),
            (header::AUTHORIZATION, format!("Bearer {}", own.as_str())),
        ],
        PONG,
    )
        .into_response()
}

/// Client side of the JWT ping-pong.
pub struct JwtClient {
    http: reqwest::Client,
    url: String,
    own_token: TokenCache,
    validator: Arc<dyn TokenValidator>,
    expected_server: SpiffeId,
}

impl std::fmt::Debug for JwtClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtClient")
            .field("url", &self.url)
            .field("expected_server", &self.expected_server)
            .finish_non_exhaustive()
    }
}

impl JwtClient {
    /// Creates a client that pings `url` and only trusts `expected_server`.
    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        source: Arc<dyn TokenSource>,
        validator: Arc<dyn TokenValidator>,
        expected_server: SpiffeId,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            own_token: TokenCache::new(source, SERVER_AUDIENCE),
            validator,
            expected_server,
        }
    }

    /// Our token for [`SERVER_AUDIENCE`], refetched near expiry.
    ///
    /// # Errors
    ///
    /// Fails when the agent cannot issue a token.
    pub async fn token(&self) -> Result<JwtToken> {
        self.own_token.get().await
    }

    /// Sends one ping with `token` and checks the server's answer.
    ///
    /// # Errors
    ///
    /// [`Error::MissingServerToken`], [`Error::InvalidServerToken`] and
    /// [`Error::UnexpectedServerId`] when the server fails to authenticate,
    /// [`Error::UnexpectedStatus`] when it rejects us, transport errors
    /// otherwise.
    pub async fn ping(&self, token: &JwtToken) -> Result<String> {
        let response = self
            .http
            .get(&self.url)
            .bearer_auth(token.as_str())
            .send()
            .await?;

        let server_token = authorization(response.headers())
            .map(str::to_owned)
            .ok_or(Error::MissingServerToken)?;

        let server_id = self
            .validator
            .validate(&server_token, CLIENT_AUDIENCE)
            .await
            .map_err(Error::InvalidServerToken)?;

        if server_id != self.expected_server {
            return Err(Error::UnexpectedServerId(server_id.to_string()));
        }

        let body = pingpong::ok_body(response).await?;
        info!(from = %server_id, "{body}");
        Ok(body)
    }
}
