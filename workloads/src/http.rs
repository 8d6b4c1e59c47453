//! Serving an axum [`Router`] over plain TCP or SPIFFE mTLS.
//!
//! Connections are driven by hyper directly rather than through
//! `axum::serve` so that the TLS handshake result can travel with the
//! connection: every request carries the peer's [`PeerIdentity`] as an
//! [`Extension`].

use crate::error::Result;
use axum::{Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use workload_identity::{PeerIdentity, TlsAcceptor};

/// Time allowed for the request head to arrive.
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Time in-flight connections get to finish after shutdown was requested.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

type HandshakeHook = Arc<dyn Fn() + Send + Sync>;

/// An HTTP server bound to one TCP port.
pub struct Server {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    on_handshake_error: Option<HandshakeHook>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("tls", &self.acceptor.is_some())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            acceptor: None,
            on_handshake_error: None,
        })
    }

    /// Terminates TLS on every accepted connection.
    #[must_use]
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    /// Calls `hook` after each failed TLS handshake.
    #[must_use]
    pub fn on_handshake_error(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_handshake_error = Some(Arc::new(hook));
        self
    }

    /// The address actually bound, useful with port 0.
    ///
    /// # Errors
    ///
    /// Fails if the socket has been closed.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` is cancelled, then gives open
    /// connections [`DRAIN_TIMEOUT`] to finish.
    ///
    /// # Errors
    ///
    /// Accept and handshake failures are logged, not returned; the current
    /// signature leaves room for fatal listener errors.
    pub async fn serve(self, router: Router, shutdown: CancellationToken) -> Result<()> {
        let scheme = if self.acceptor.is_some() { "https" } else { "http" };
        info!(addr = ?self.listener.local_addr().ok(), scheme, "server listening");

        let mut connections = JoinSet::new();

        loop {
            let (stream, remote) = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let router = router.clone();
            let shutdown = shutdown.clone();

            match self.acceptor.clone() {
                Some(acceptor) => {
                    let on_handshake_error = self.on_handshake_error.clone();
                    connections.spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok((tls, peer)) => {
                                debug!(%remote, peer = ?peer.spiffe_id(), "TLS handshake complete");
                                serve_connection(tls, router, peer, shutdown).await;
                            }
                            Err(e) => {
                                if let Some(hook) = on_handshake_error {
                                    hook();
                                }
                                warn!(%remote, error = %e, "TLS handshake failed");
                            }
                        }
                    });
                }
                None => {
                    connections.spawn(serve_connection(
                        stream,
                        router,
                        PeerIdentity::anonymous(),
                        shutdown,
                    ));
                }
            }

            while connections.try_join_next().is_some() {}
        }

        info!(open = connections.len(), "shutting down server");

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(open = connections.len(), "connections did not finish in time; aborting");
            connections.shutdown().await;
        }

        Ok(())
    }
}

async fn serve_connection<I>(
    io: I,
    router: Router,
    peer: PeerIdentity,
    shutdown: CancellationToken,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(router.layer(Extension(peer)));

    let mut builder = Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);

    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(conn);

    let mut draining = false;
    let result = loop {
        tokio::select! {
            result = conn.as_mut() => break result,
            () = shutdown.cancelled(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    };

    if let Err(e) = result {
        debug!(error = %e, "connection closed with error");
    }
}

/// Cancels `shutdown` on Ctrl-C or SIGTERM.
pub fn cancel_on_signal(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                info!("shutdown requested");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "failed to install signal handler"),
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
