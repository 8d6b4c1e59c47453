use crate::cert;
use crate::error::{Error, Result};
use rustls::pki_types::CertificateDer;
use spiffe::SpiffeId;

/// Identity of the peer on an accepted connection.
///
/// `spiffe_id` is `None` for plaintext connections and for peers whose leaf
/// does not carry exactly one SPIFFE ID. With the verifiers from this crate
/// the latter cannot complete a handshake.
#[derive(Debug, Clone, Default)]
pub struct PeerIdentity {
    /// The SPIFFE ID from the peer's leaf certificate, if any.
    pub spiffe_id: Option<SpiffeId>,
}

impl PeerIdentity {
    /// Creates a new `PeerIdentity` with the given SPIFFE ID.
    pub fn new(spiffe_id: Option<SpiffeId>) -> Self {
        Self { spiffe_id }
    }

    /// An identity for connections without TLS.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Returns the peer's SPIFFE ID, if present.
    pub fn spiffe_id(&self) -> Option<&SpiffeId> {
        self.spiffe_id.as_ref()
    }

    /// Reads the identity from the peer certificates of a finished handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CertParse`] if the leaf is not a parsable certificate.
    pub fn from_peer_certificates(peer_certs: Option<&[CertificateDer<'_>]>) -> Result<Self> {
        let Some(leaf) = peer_certs.and_then(<[_]>::first) else {
            return Ok(Self::anonymous());
        };

        match cert::spiffe_id_from_der(leaf.as_ref()) {
            Ok(id) => Ok(Self::new(Some(id))),
            Err(Error::MissingSpiffeId | Error::MultipleSpiffeIds | Error::InvalidSpiffeId(_)) => {
                Ok(Self::anonymous())
            }
            Err(e) => Err(e),
        }
    }
}
