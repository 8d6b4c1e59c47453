mod common;

use common::{bind_local, Running, TestCa, CLIENT_ID, SERVER_ID};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use workload_identity::{authorizer, Authorizer, MaterialWatcher};
use workloads::metrics::{watch_svid_updates, ClientMetrics, ServerMetrics};
use workloads::pingpong::{self, PongState};
use workloads::tls;

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn start_server(
    ca: &TestCa,
    client_authorizer: impl Authorizer,
    announce: bool,
) -> (Running, Arc<ServerMetrics>) {
    let watcher = ca.watcher(SERVER_ID);
    let metrics = ServerMetrics::new().unwrap();
    let state = PongState {
        metrics: Arc::clone(&metrics),
        announce: announce.then(|| watcher.current().spiffe_id().clone()),
    };
    let handshake_metrics = Arc::clone(&metrics);
    let server = bind_local()
        .await
        .with_tls(tls::mtls_acceptor(watcher, client_authorizer).unwrap())
        .on_handshake_error(move || handshake_metrics.tls_errors.inc());

    let router = pingpong::mtls_router(state).merge(metrics.router());
    (Running::start(server, router), metrics)
}

#[tokio::test]
async fn mtls_pong_announces_server_identity() {
    workload_identity::ensure_crypto_provider_installed();
    let ca = TestCa::new("example.org");
    let (server, metrics) =
        start_server(&ca, authorizer::path_segment("sa", "ping-pong-client"), true).await;

    let client = tls::mtls_http_client(
        ca.watcher(CLIENT_ID),
        authorizer::exact([SERVER_ID]).unwrap(),
    )
    .unwrap();

    let body = pingpong::ping(&client, &format!("https://{}/", server.addr))
        .await
        .unwrap();
    assert_eq!(body, format!("...pong from {SERVER_ID}"));

    let vars: serde_json::Value = client
        .get(format!("https://{}/debug/vars", server.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(vars["requests_total"], 1);
    assert_eq!(vars["successful_connections"], 1);
    assert_eq!(metrics.tls_errors.get(), 0);

    server.stop().await;
}

#[tokio::test]
async fn any_path_gets_pong_next_to_debug_vars() {
    workload_identity::ensure_crypto_provider_installed();
    let ca = TestCa::new("example.org");
    let (server, metrics) = start_server(&ca, authorizer::any(), false).await;

    let client = tls::mtls_http_client(ca.watcher(CLIENT_ID), authorizer::any()).unwrap();

    let body = pingpong::ping(&client, &format!("https://{}/healthz", server.addr))
        .await
        .unwrap();
    assert_eq!(body, pingpong::PONG);

    let response = client
        .post(format!("https://{}/", server.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(pingpong::ok_body(response).await.unwrap(), pingpong::PONG);

    let vars: serde_json::Value = client
        .get(format!("https://{}/debug/vars", server.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(vars["requests_total"], 2);
    assert_eq!(metrics.requests_total.get(), 2);

    server.stop().await;
}

#[tokio::test]
async fn plain_pong_without_announcement() {
    workload_identity::ensure_crypto_provider_installed();
    let ca = TestCa::new("example.org");
    let (server, _) = start_server(&ca, authorizer::any(), false).await;

    let client = tls::mtls_http_client(ca.watcher(CLIENT_ID), authorizer::any()).unwrap();
    let body = pingpong::ping(&client, &format!("https://{}/", server.addr))
        .await
        .unwrap();
    assert_eq!(body, pingpong::PONG);

    server.stop().await;
}

#[tokio::test]
async fn unauthorized_client_is_counted_as_tls_error() {
    workload_identity::ensure_crypto_provider_installed();
    let ca = TestCa::new("example.org");
    let (server, metrics) =
        start_server(&ca, authorizer::exact([CLIENT_ID]).unwrap(), false).await;

    let intruder = tls::mtls_http_client(
        ca.watcher("spiffe://example.org/ns/demo/sa/intruder"),
        authorizer::any(),
    )
    .unwrap();

    assert!(pingpong::ping(&intruder, &format!("https://{}/", server.addr))
        .await
        .is_err());
    eventually(|| metrics.tls_errors.get() == 1).await;
    assert_eq!(metrics.requests_total.get(), 0);

    server.stop().await;
}

#[tokio::test]
async fn client_rejects_unexpected_server() {
    workload_identity::ensure_crypto_provider_installed();
    let ca = TestCa::new("example.org");
    let (server, _) = start_server(&ca, authorizer::any(), false).await;

    let client = tls::mtls_http_client(
        ca.watcher(CLIENT_ID),
        authorizer::exact(["spiffe://example.org/ns/demo/sa/someone-else"]).unwrap(),
    )
    .unwrap();

    assert!(pingpong::ping(&client, &format!("https://{}/", server.addr))
        .await
        .is_err());

    server.stop().await;
}

#[tokio::test]
async fn server_from_another_trust_domain_is_rejected() {
    workload_identity::ensure_crypto_provider_installed();
    let ours = TestCa::new("example.org");
    let theirs = TestCa::new("example.org");
    let (server, _) = start_server(&theirs, authorizer::any(), false).await;

    let client = tls::mtls_http_client(ours.watcher(CLIENT_ID), authorizer::any()).unwrap();

    assert!(pingpong::ping(&client, &format!("https://{}/", server.addr))
        .await
        .is_err());

    server.stop().await;
}

#[tokio::test]
async fn rotated_client_svid_is_used_on_next_connection() {
    workload_identity::ensure_crypto_provider_installed();
    let ca = TestCa::new("example.org");
    let (server, _) = start_server(&ca, authorizer::exact([CLIENT_ID]).unwrap(), false).await;

    let (watcher, publisher) =
        MaterialWatcher::channel(&ca.material("spiffe://example.org/ns/demo/sa/old-client")).unwrap();
    let client = tls::mtls_http_client(watcher, authorizer::any()).unwrap();
    let url = format!("https://{}/", server.addr);

    assert!(pingpong::ping(&client, &url).await.is_err());

    publisher.publish(&ca.material(CLIENT_ID)).unwrap();

    assert_eq!(pingpong::ping(&client, &url).await.unwrap(), pingpong::PONG);

    server.stop().await;
}

#[tokio::test]
async fn svid_gauges_follow_rotation() {
    let ca = TestCa::new("example.org");
    let (watcher, publisher) = MaterialWatcher::channel(&ca.material(CLIENT_ID)).unwrap();
    let metrics = ClientMetrics::new().unwrap();
    let shutdown = CancellationToken::new();

    let task = tokio::spawn(watch_svid_updates(
        watcher.clone(),
        Arc::clone(&metrics),
        shutdown.clone(),
    ));

    eventually(|| metrics.svid_not_after.get() > 0).await;
    assert!(metrics.last_x509_source_update.get() > 0);

    let rotated = "spiffe://example.org/ns/demo/sa/ping-pong-client-v2";
    publisher.publish(&ca.material(rotated)).unwrap();

    eventually(|| metrics.render().matches("svid_uri_san{").count() == 2).await;
    let text = metrics.render();
    assert!(text.contains(&format!("svid_uri_san{{spiffe_id=\"{CLIENT_ID}\"}} 1")));
    assert!(text.contains(&format!("svid_uri_san{{spiffe_id=\"{rotated}\"}} 1")));

    shutdown.cancel();
    task.await.unwrap();
}
