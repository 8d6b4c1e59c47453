use crate::agent::{bounded, Agent};
use crate::error::Result;
use crate::material::{MaterialSnapshot, X509Material, X509MaterialSource};
use rustls::client::ResolvesClientCert;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;
use spiffe::{TrustDomain, X509Source, X509SourceBuilder};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Keeps the current rustls material and follows SVID/bundle rotation.
///
/// Cloning is cheap. The background task stops when the last clone is dropped
/// or [`MaterialWatcher::shutdown`] is called.
#[derive(Clone, Debug)]
pub struct MaterialWatcher {
    rx: watch::Receiver<Arc<MaterialSnapshot>>,
    guard: Option<Arc<WatcherGuard>>,
}

#[derive(Debug)]
struct WatcherGuard {
    source: Arc<X509Source>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl WatcherGuard {
    fn stop(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            if let Err(e) = self.source.close() {
                debug!(error = %e, "X.509 source already closed");
            }
        }
    }
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        self.stop();
        self.task.abort();
    }
}

/// Pushes new material into a [`MaterialWatcher`].
#[derive(Debug)]
pub struct MaterialPublisher {
    tx: watch::Sender<Arc<MaterialSnapshot>>,
}

impl MaterialPublisher {
    /// Builds a snapshot from `material` under the next generation and makes
    /// it current. On error the previous snapshot stays in place.
    ///
    /// # Errors
    ///
    /// See [`MaterialSnapshot::build`].
    pub fn publish(&self, material: &X509Material) -> Result<u64> {
        let generation = self.tx.borrow().generation() + 1;
        let snapshot = MaterialSnapshot::build(generation, material)?;
        self.tx.send_replace(Arc::new(snapshot));
        Ok(generation)
    }
}

impl MaterialWatcher {
    /// Opens an X.509 source on the agent (waiting, bounded by the agent
    /// timeout, for its first context) and republishes the material on every
    /// source update.
    ///
    /// `federated` lists extra trust domains whose bundles should be kept next
    /// to the SVID's own.
    ///
    /// # Errors
    ///
    /// Fails if the source cannot be built in time or its first material is
    /// unusable.
    pub async fn start(agent: &Agent, federated: Vec<TrustDomain>) -> Result<Self> {
        let source = bounded(
            agent.timeout(),
            X509SourceBuilder::new().with_client(agent.client()).build(),
        )
        .await?;

        let initial = X509Material::from_source(&*source, &federated)
            .and_then(|material| Self::channel(&material));
        let (watcher, publisher) = match initial {
            Ok(pair) => pair,
            Err(e) => {
                let _ = source.close();
                return Err(e);
            }
        };
        info!(spiffe_id = %watcher.current().spiffe_id(), "received X.509-SVID");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(follow_updates(
            Arc::clone(&source),
            federated,
            publisher,
            cancel.clone(),
        ));

        Ok(Self {
            guard: Some(Arc::new(WatcherGuard {
                source,
                cancel,
                task,
            })),
            ..watcher
        })
    }

    /// A watcher whose material never changes.
    ///
    /// # Errors
    ///
    /// See [`MaterialSnapshot::build`].
    pub fn fixed(material: &X509Material) -> Result<Self> {
        Self::channel(material).map(|(watcher, _)| watcher)
    }

    /// A watcher fed by hand through the returned publisher.
    ///
    /// # Errors
    ///
    /// See [`MaterialSnapshot::build`].
    pub fn channel(material: &X509Material) -> Result<(Self, MaterialPublisher)> {
        let initial = Arc::new(MaterialSnapshot::build(0, material)?);
        let (tx, rx) = watch::channel(initial);
        Ok((Self { rx, guard: None }, MaterialPublisher { tx }))
    }

    /// The current snapshot.
    pub fn current(&self) -> Arc<MaterialSnapshot> {
        self.rx.borrow().clone()
    }

    /// A receiver notified on every rotation.
    pub fn subscribe(&self) -> watch::Receiver<Arc<MaterialSnapshot>> {
        self.rx.clone()
    }

    /// Stops following the agent. The last snapshot stays readable.
    pub fn shutdown(&self) {
        if let Some(guard) = &self.guard {
            guard.stop();
        }
    }
}

async fn follow_updates(
    source: Arc<X509Source>,
    federated: Vec<TrustDomain>,
    publisher: MaterialPublisher,
    cancel: CancellationToken,
) {
    let mut updated = source.updated();
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("material watcher cancelled; stopping");
                return;
            }
            changed = updated.changed() => {
                if changed.is_err() {
                    debug!("X.509 source dropped; stopping");
                    return;
                }
                if let Some(generation) = republish(&*source, &federated, &publisher) {
                    info!(generation, "updated X.509 material");
                }
            }
        }
    }
}

// Rebuilds the snapshot from whatever `source` holds now. Failures are logged
// and leave the previous snapshot current.
fn republish<S: X509MaterialSource + ?Sized>(
    source: &S,
    federated: &[TrustDomain],
    publisher: &MaterialPublisher,
) -> Option<u64> {
    match X509Material::from_source(source, federated).and_then(|m| publisher.publish(&m)) {
        Ok(generation) => Some(generation),
        Err(e) => {
            error!(error = %e, "failed rebuilding X.509 material; keeping previous");
            None
        }
    }
}

// Hands rustls whatever SVID the watcher holds at handshake time, on both
// sides of the connection.
#[derive(Clone, Debug)]
pub(crate) struct CurrentSvid(pub(crate) MaterialWatcher);

impl ResolvesClientCert for CurrentSvid {
    fn resolve(&self, _: &[&[u8]], _: &[SignatureScheme]) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(self.0.current().certified_key()))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

impl ResolvesServerCert for CurrentSvid {
    fn resolve(&self, _: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(self.0.current().certified_key()))
    }
}
