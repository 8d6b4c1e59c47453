use crate::error::Error;
use crate::peer::PeerIdentity;
use rustls::ServerConfig;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor as TokioTlsAcceptor;

/// A TLS acceptor that reports the verified peer identity.
///
/// Wraps [`tokio_rustls::TlsAcceptor`]; after the handshake the peer's SPIFFE
/// ID is read from its leaf certificate.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: TokioTlsAcceptor,
}

impl std::fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsAcceptor").finish_non_exhaustive()
    }
}

impl TlsAcceptor {
    /// Creates a new `TlsAcceptor` from a `ServerConfig`.
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self::from(config)
    }

    /// Runs the server side of the handshake on `stream`.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the handshake fails (including peer verification),
    /// [`Error::CertParse`] if the verified peer certificate cannot be parsed.
    pub async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<(TlsStream<TcpStream>, PeerIdentity), Error> {
        let tls_stream = self.inner.accept(stream).await?;

        let (_io, connection) = tls_stream.get_ref();
        let peer_identity = PeerIdentity::from_peer_certificates(connection.peer_certificates())?;

        Ok((tls_stream, peer_identity))
    }
}

impl From<Arc<ServerConfig>> for TlsAcceptor {
    fn from(config: Arc<ServerConfig>) -> Self {
        Self {
            inner: TokioTlsAcceptor::from(config),
        }
    }
}
