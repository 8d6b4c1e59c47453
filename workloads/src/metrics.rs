//! Process-local metrics exposed over HTTP.
//!
//! Clients publish Prometheus text on `/metrics` from their own registry;
//! servers publish an expvar-style JSON object on `/debug/vars`.

use crate::error::Result;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use workload_identity::{MaterialSnapshot, MaterialWatcher};

/// Seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Metrics of a ping-pong client.
pub struct ClientMetrics {
    registry: Registry,
    /// Pings that failed.
    pub ping_errors: IntCounter,
    /// Failures to obtain an SVID.
    pub svid_failures: IntCounter,
    /// Failed TLS handshakes.
    pub tls_errors: IntCounter,
    /// Pings attempted.
    pub requests_total: IntCounter,
    /// Pings that succeeded.
    pub successful_connections: IntCounter,
    /// When the client started.
    pub client_start_time: IntGauge,
    /// When the X.509 material last changed.
    pub last_x509_source_update: IntGauge,
    /// Expiry of the current SVID.
    pub svid_not_after: IntGauge,
    /// SPIFFE ID of the current SVID, as the `spiffe_id` label.
    pub svid_uri_san: IntGaugeVec,
}

impl std::fmt::Debug for ClientMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMetrics")
            .field("requests_total", &self.requests_total.get())
            .field("ping_errors", &self.ping_errors.get())
            .field("tls_errors", &self.tls_errors.get())
            .finish_non_exhaustive()
    }
}

impl ClientMetrics {
    /// Registers the client metrics in a fresh registry with
    /// `client_start_time` set to now.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Metrics`] if a metric is rejected by the registry.
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();
        let svid_uri_san = IntGaugeVec::new(
            Opts::new(
                "svid_uri_san",
                "The SPIFFE ID URI SAN of the current SVID certificate",
            ),
            &["spiffe_id"],
        )?;
        registry.register(Box::new(svid_uri_san.clone()))?;

        let metrics = Self {
            ping_errors: counter(&registry, "ping_errors", "The total number of ping errors")?,
            svid_failures: counter(&registry, "svid_failures", "The total number of SVID failures")?,
            tls_errors: counter(&registry, "tls_errors", "The total number of TLS errors")?,
            requests_total: counter(&registry, "requests_total", "The total number of requests sent")?,
            successful_connections: counter(
                &registry,
                "successful_connections",
                "The total number of successful connections",
            )?,
            client_start_time: gauge(
                &registry,
                "client_start_time",
                "The timestamp when the client started",
            )?,
            last_x509_source_update: gauge(
                &registry,
                "last_x509_source_update",
                "The timestamp of the last X509Source update",
            )?,
            svid_not_after: gauge(
                &registry,
                "svid_not_after",
                "The timestamp when the current SVID certificate expires (NotAfter)",
            )?,
            svid_uri_san,
            registry,
        };
        metrics.client_start_time.set(unix_now());
        Ok(Arc::new(metrics))
    }

    /// Records a new SVID generation.
    pub fn record_svid(&self, snapshot: &MaterialSnapshot) {
        self.last_x509_source_update.set(unix_now());
        self.svid_not_after.set(snapshot.not_after());
        self.svid_uri_san
            .with_label_values(&[&snapshot.spiffe_id().to_string()])
            .set(1);
    }

    /// Renders the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            error!(error = %e, "failed encoding metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Router serving `GET /metrics`.
    pub fn router(self: &Arc<Self>) -> Router {
        let metrics = Arc::clone(self);
        Router::new().route(
            "/metrics",
            get(move || {
                let body = metrics.render();
                async move { ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body) }
            }),
        )
    }
}

/// Metrics of a ping-pong server.
pub struct ServerMetrics {
    /// Requests answered.
    pub successful_connections: IntCounter,
    /// Responses that could not be written.
    pub handler_errors: IntCounter,
    /// Failures to obtain an SVID.
    pub svid_failures: IntCounter,
    /// Failed TLS handshakes.
    pub tls_errors: IntCounter,
    /// Requests received.
    pub requests_total: IntCounter,
    /// When the server started.
    pub server_start_time: IntGauge,
}

impl std::fmt::Debug for ServerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMetrics")
            .field("requests_total", &self.requests_total.get())
            .field("tls_errors", &self.tls_errors.get())
            .finish_non_exhaustive()
    }
}

impl ServerMetrics {
    /// Creates the metrics with `server_start_time` set to now.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Metrics`] if a metric is rejected by the registry.
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();
        let metrics = Self {
            successful_connections: counter(
                &registry,
                "successful_connections",
                "The total number of successful connections",
            )?,
            handler_errors: counter(&registry, "handler_errors", "The total number of handler errors")?,
            svid_failures: counter(&registry, "svid_failures", "The total number of SVID failures")?,
            tls_errors: counter(&registry, "tls_errors", "The total number of TLS errors")?,
            requests_total: counter(&registry, "requests_total", "The total number of requests received")?,
            server_start_time: gauge(
                &registry,
                "server_start_time",
                "The timestamp when the server started",
            )?,
        };
        metrics.server_start_time.set(unix_now());
        Ok(Arc::new(metrics))
    }

    /// Renders the expvar JSON object, including the command line.
    pub fn render(&self) -> Value {
        let mut vars = Map::new();
        vars.insert("cmdline".into(), json!(std::env::args().collect::<Vec<_>>()));
        vars.insert("handler_errors".into(), json!(self.handler_errors.get()));
        vars.insert("requests_total".into(), json!(self.requests_total.get()));
        vars.insert("server_start_time".into(), json!(self.server_start_time.get()));
        vars.insert(
            "successful_connections".into(),
            json!(self.successful_connections.get()),
        );
        vars.insert("svid_failures".into(), json!(self.svid_failures.get()));
        vars.insert("tls_errors".into(), json!(self.tls_errors.get()));
        Value::Object(vars)
    }

    /// Router serving `GET /debug/vars`.
    pub fn router(self: &Arc<Self>) -> Router {
        let metrics = Arc::clone(self);
        Router::new().route(
            "/debug/vars",
            get(move || {
                let vars = metrics.render();
                async move { Json(vars).into_response() }
            }),
        )
    }
}

/// Keeps the SVID gauges current until `shutdown` fires.
pub async fn watch_svid_updates(
    watcher: MaterialWatcher,
    metrics: Arc<ClientMetrics>,
    shutdown: CancellationToken,
) {
    let mut updates = watcher.subscribe();
    metrics.record_svid(&updates.borrow_and_update());

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            changed = updates.changed() => {
                if changed.is_err() {
                    debug!("material watcher closed");
                    return;
                }
                let snapshot = updates.borrow_and_update().clone();
                debug!(generation = snapshot.generation(), "SVID updated");
                metrics.record_svid(&snapshot);
            }
        }
    }
}
