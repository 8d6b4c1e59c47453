mod common;

use async_trait::async_trait;
use common::{bind_local, Running, CLIENT_ID, SERVER_ID};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use workload_identity::{JwtToken, SpiffeId, TokenSource, TokenValidator};
use workloads::jwt_auth::{self, JwtClient, TokenCache, SERVER_AUDIENCE};
use workloads::{tls, Error};

const SECRET: &[u8] = b"shared-agent-signing-key";

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: String,
    aud: String,
    exp: u64,
}

/// Issues and validates HS256 tokens in place of a SPIRE agent.
struct FakeAgent {
    id: String,
    ttl: Duration,
    fetches: AtomicUsize,
}

impl FakeAgent {
    fn new(id: &str) -> Arc<Self> {
        Self::with_ttl(id, Duration::from_secs(3600))
    }

    fn with_ttl(id: &str, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            ttl,
            fetches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TokenSource for FakeAgent {
    async fn fetch_token(&self, audience: &str) -> workload_identity::Result<JwtToken> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let exp = (SystemTime::now() + self.ttl)
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let claims = Claims {
            sub: self.id.clone(),
            aud: audience.to_string(),
            exp,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .map_err(|e| workload_identity::Error::Jwt(e.to_string()))?;
        JwtToken::parse(token)
    }
}

#[async_trait]
impl TokenValidator for FakeAgent {
    async fn validate(&self, token: &str, audience: &str) -> workload_identity::Result<SpiffeId> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[audience]);
        let data = jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(SECRET), &validation)
            .map_err(|e| workload_identity::Error::Jwt(e.to_string()))?;
        SpiffeId::new(&data.claims.sub).map_err(|e| workload_identity::Error::Jwt(e.to_string()))
    }
}

async fn start_server(authorized_client: &str) -> Running {
    let agent = FakeAgent::new(SERVER_ID);
    let router = jwt_auth::server_router(
        agent.clone(),
        agent,
        SpiffeId::new(authorized_client).unwrap(),
    );
    Running::start(bind_local().await, router)
}

fn client_for(server: &Running, id: &str, expected_server: &str) -> JwtClient {
    let agent = FakeAgent::new(id);
    JwtClient::new(
        tls::http_client(false).unwrap(),
        format!("http://{}/", server.addr),
        agent.clone(),
        agent,
        SpiffeId::new(expected_server).unwrap(),
    )
}

#[tokio::test]
async fn tokens_are_checked_in_both_directions() {
    let server = start_server(CLIENT_ID).await;
    let client = client_for(&server, CLIENT_ID, SERVER_ID);

    let token = client.token().await.unwrap();
    assert_eq!(client.ping(&token).await.unwrap(), "...pong");

    server.stop().await;
}

#[tokio::test]
async fn any_path_and_method_is_authenticated_the_same() {
    let server = start_server(CLIENT_ID).await;
    let token = FakeAgent::new(CLIENT_ID)
        .fetch_token(SERVER_AUDIENCE)
        .await
        .unwrap();

    let response = reqwest::Client::new()
        .post(format!("http://{}/some/path", server.addr))
        .bearer_auth(token.as_str())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.headers().contains_key("authorization"));
    assert_eq!(response.text().await.unwrap(), "...pong");

    let response = reqwest::Client::new()
        .get(format!("http://{}/healthz", server.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert_eq!(response.text().await.unwrap(), "No token provided by client");

    server.stop().await;
}

#[tokio::test]
async fn unauthorized_client_gets_no_server_token() {
    let server = start_server(CLIENT_ID).await;
    let client = client_for(&server, "spiffe://example.org/ns/demo/sa/intruder", SERVER_ID);

    let token = client.token().await.unwrap();
    assert!(matches!(
        client.ping(&token).await,
        Err(Error::MissingServerToken)
    ));

    let response = reqwest::Client::new()
        .get(format!("http://{}/", server.addr))
        .bearer_auth(token.as_str())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert_eq!(response.text().await.unwrap(), "Invalid client ID");

    server.stop().await;
}

#[tokio::test]
async fn request_without_token_is_rejected() {
    let server = start_server(CLIENT_ID).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/", server.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert_eq!(response.text().await.unwrap(), "No token provided by client");

    let response = reqwest::Client::new()
        .get(format!("http://{}/", server.addr))
        .header("Authorization", "Basic dXNlcjpwYXNz")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert_eq!(response.text().await.unwrap(), "No token provided by client");

    server.stop().await;
}

#[tokio::test]
async fn token_for_wrong_audience_is_rejected() {
    let server = start_server(CLIENT_ID).await;
    let token = FakeAgent::new(CLIENT_ID)
        .fetch_token("someone-else")
        .await
        .unwrap();

    let response = reqwest::Client::new()
        .get(format!("http://{}/", server.addr))
        .bearer_auth(token.as_str())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert!(response
        .text()
        .await
        .unwrap()
        .starts_with("Invalid client token provided"));

    server.stop().await;
}

#[tokio::test]
async fn garbage_token_is_rejected() {
    let server = start_server(CLIENT_ID).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/", server.addr))
        .header("Authorization", "Bearer not-a-jwt")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert!(response
        .text()
        .await
        .unwrap()
        .starts_with("Invalid client token provided"));

    server.stop().await;
}

#[tokio::test]
async fn client_rejects_unexpected_server_identity() {
    let server = start_server(CLIENT_ID).await;
    let client = client_for(
        &server,
        CLIENT_ID,
        "spiffe://example.org/ns/demo/sa/another-server",
    );

    let token = client.token().await.unwrap();
    match client.ping(&token).await {
        Err(Error::UnexpectedServerId(id)) => assert_eq!(id, SERVER_ID),
        other => panic!("unexpected result: {other:?}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn token_cache_reuses_long_lived_tokens() {
    let agent = FakeAgent::new(CLIENT_ID);
    let cache = TokenCache::new(agent.clone(), SERVER_AUDIENCE);

    let first = cache.get().await.unwrap();
    let second = cache.get().await.unwrap();

    assert_eq!(first.as_str(), second.as_str());
    assert_eq!(agent.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(first.audience(), [SERVER_AUDIENCE.to_string()]);
}

#[tokio::test]
async fn token_cache_refetches_near_expiry() {
    let agent = FakeAgent::with_ttl(CLIENT_ID, Duration::from_secs(30));
    let cache = TokenCache::new(agent.clone(), SERVER_AUDIENCE);

    cache.get().await.unwrap();
    cache.get().await.unwrap();

    assert_eq!(agent.fetches.load(Ordering::SeqCst), 2);
}
