use crate::error::{Error, Result};
use crate::jwt::JwtToken;
use crate::material::X509Material;
use async_trait::async_trait;
use spiffe::{SpiffeId, TrustDomain, WorkloadApiClient, X509Context};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming the Workload API socket.
pub const SPIFFE_ENDPOINT_SOCKET_ENV: &str = "SPIFFE_ENDPOINT_SOCKET";

/// Socket used when `SPIFFE_ENDPOINT_SOCKET` is unset.
pub const DEFAULT_AGENT_SOCKET: &str = "unix:///spiffe-workload-api/spire-agent.sock";

/// Upper bound for connecting to the agent and for each unary call.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the local SPIFFE Workload API agent.
///
/// Cloning is cheap: clones share the underlying gRPC channel.
#[derive(Clone, Debug)]
pub struct Agent {
    client: WorkloadApiClient,
    socket: String,
    timeout: Duration,
}

impl Agent {
    /// Connects to the agent at `socket`. The address must carry a scheme,
    /// as in `unix:///run/spire/agent.sock`; bare paths are rejected.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if the socket does not answer within `timeout`,
    /// [`Error::WorkloadApi`] for a malformed address or any other connection
    /// failure.
    pub async fn connect(socket: &str, timeout: Duration) -> Result<Self> {
        let client = bounded(timeout, WorkloadApiClient::new_from_path(socket)).await?;
        info!(socket, "connected to workload API");
        Ok(Self {
            client,
            socket: socket.to_string(),
            timeout,
        })
    }

    /// Connects using `SPIFFE_ENDPOINT_SOCKET`, falling back to
    /// [`DEFAULT_AGENT_SOCKET`], with [`DEFAULT_AGENT_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// See [`Agent::connect`].
    pub async fn connect_default() -> Result<Self> {
        let socket = std::env::var(SPIFFE_ENDPOINT_SOCKET_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_AGENT_SOCKET.to_string());
        Self::connect(&socket, DEFAULT_AGENT_TIMEOUT).await
    }

    /// Socket this agent handle is connected to.
    pub fn socket_path(&self) -> &str {
        &self.socket
    }

    /// Timeout applied to each unary call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetches the current X.509 context once.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] or [`Error::WorkloadApi`].
    pub async fn fetch_x509_context(&self) -> Result<X509Context> {
        let mut client = self.client.clone();
        bounded(self.timeout, client.fetch_x509_context()).await
    }

    /// Fetches the default X.509-SVID and the bundles for its own and the
    /// given federated trust domains.
    ///
    /// # Errors
    ///
    /// Agent errors, or see [`X509Material::from_context`].
    pub async fn fetch_x509_material(&self, federated: &[TrustDomain]) -> Result<X509Material> {
        let context = self.fetch_x509_context().await?;
        X509Material::from_context(&context, federated)
    }

    /// Fetches the default JWT-SVID for a single audience.
    ///
    /// # Errors
    ///
    /// Agent errors, or [`Error::Jwt`] if the returned token does not decode.
    pub async fn fetch_jwt(&self, audience: &str) -> Result<JwtToken> {
        let mut client = self.client.clone();
        let token = bounded(self.timeout, client.fetch_jwt_token(&[audience], None)).await?;
        let token = JwtToken::parse(token)?;
        debug!(audience, subject = %token.subject(), "fetched JWT-SVID");
        Ok(token)
    }

    /// Asks the agent to validate `token` for `audience` and returns its subject.
    ///
    /// # Errors
    ///
    /// [`Error::WorkloadApi`] when the agent rejects the token.
    pub async fn validate_jwt(&self, token: &str, audience: &str) -> Result<SpiffeId> {
        let mut client = self.client.clone();
        let svid = bounded(self.timeout, client.validate_jwt_token(audience, token)).await?;
        Ok(svid.spiffe_id().clone())
    }

    pub(crate) fn client(&self) -> WorkloadApiClient {
        self.client.clone()
    }
}

/// Something that can hand out JWT-SVIDs for an audience.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    /// Returns a JWT-SVID for `audience`.
    async fn fetch_token(&self, audience: &str) -> Result<JwtToken>;
}

/// Something that can validate a peer's JWT-SVID for our audience.
#[async_trait]
pub trait TokenValidator: Send + Sync + 'static {
    /// Validates `token` for `audience` and returns the subject SPIFFE ID.
    async fn validate(&self, token: &str, audience: &str) -> Result<SpiffeId>;
}

#[async_trait]
impl TokenSource for Agent {
    async fn fetch_token(&self, audience: &str) -> Result<JwtToken> {
        self.fetch_jwt(audience).await
    }
}

#[async_trait]
impl TokenValidator for Agent {
    async fn validate(&self, token: &str, audience: &str) -> Result<SpiffeId> {
        self.validate_jwt(token, audience).await
    }
}

pub(crate) async fn bounded<T, E, F>(timeout: Duration, fut: F) -> Result<T>
where
    E: Display,
    F: Future<Output = std::result::Result<T, E>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::WorkloadApi(e.to_string())),
        Err(_elapsed) => Err(Error::Timeout(timeout)),
    }
}
