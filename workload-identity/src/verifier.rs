//! rustls verifiers that authenticate peers against SPIFFE trust bundles and
//! authorize them by SPIFFE ID.
//!
//! Both verifiers follow the same steps: read the SPIFFE ID from the leaf,
//! check the trust domain policy, select that trust domain's roots from the
//! current material, verify the chain, and only then run the authorizer.
//! Hostnames are never checked; an SVID identifies a workload by URI SAN.

use crate::authorizer::Authorizer;
use crate::cert;
use crate::error::{Error, Result};
use crate::material::MaterialSnapshot;
use crate::policy::TrustDomainPolicy;
use crate::watcher::MaterialWatcher;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};
use spiffe::{SpiffeId, TrustDomain};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Source of the material the verifiers check against.
pub(crate) trait MaterialProvider: Send + Sync {
    fn current_material(&self) -> Arc<MaterialSnapshot>;
}

impl MaterialProvider for MaterialWatcher {
    fn current_material(&self) -> Arc<MaterialSnapshot> {
        self.current()
    }
}

fn other_err<E>(e: E) -> rustls::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rustls::Error::Other(rustls::OtherError(Arc::new(e)))
}

fn peer_spiffe_id(end_entity: &CertificateDer<'_>) -> std::result::Result<SpiffeId, rustls::Error> {
    cert::spiffe_id_from_der(end_entity.as_ref()).map_err(|e| {
        debug!(error = %e, "peer certificate is not an X.509-SVID");
        other_err(e)
    })
}

fn select_roots(
    snapshot: &MaterialSnapshot,
    policy: &TrustDomainPolicy,
    trust_domain: &TrustDomain,
) -> Result<Arc<RootCertStore>> {
    if !policy.allows(trust_domain) {
        return Err(Error::TrustDomainNotAllowed(trust_domain.to_string()));
    }

    snapshot
        .roots_for(trust_domain)
        .cloned()
        .ok_or_else(|| Error::NoBundle(trust_domain.to_string()))
}

fn authorize(
    authorizer: &dyn Authorizer,
    spiffe_id: &SpiffeId,
) -> std::result::Result<(), rustls::Error> {
    if authorizer.authorize(spiffe_id) {
        Ok(())
    } else {
        debug!(spiffe_id = %spiffe_id, "peer rejected by authorizer");
        Err(other_err(Error::UnauthorizedSpiffeId(spiffe_id.to_string())))
    }
}

// ------------ Server verifier (client side) ------------

pub(crate) struct SpiffeServerCertVerifier {
    provider: Arc<dyn MaterialProvider>,
    authorizer: Arc<dyn Authorizer>,
    policy: TrustDomainPolicy,
    algorithms: WebPkiSupportedAlgorithms,
}

impl SpiffeServerCertVerifier {
    pub(crate) fn new(
        provider: Arc<dyn MaterialProvider>,
        authorizer: Arc<dyn Authorizer>,
        policy: TrustDomainPolicy,
        crypto: &CryptoProvider,
    ) -> Self {
        Self {
            provider,
            authorizer,
            policy,
            algorithms: crypto.signature_verification_algorithms,
        }
    }
}

impl fmt::Debug for SpiffeServerCertVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpiffeServerCertVerifier")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ServerCertVerifier for SpiffeServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let spiffe_id = peer_spiffe_id(end_entity)?;
        let snapshot = self.provider.current_material();
        let roots =
            select_roots(&snapshot, &self.policy, spiffe_id.trust_domain()).map_err(other_err)?;

        let parsed = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &roots,
            intermediates,
            now,
            self.algorithms.all,
        )?;

        authorize(&*self.authorizer, &spiffe_id)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

// ------------ Client verifier (server side) ------------

type ClientVerifierCache = HashMap<TrustDomain, (u64, Arc<dyn ClientCertVerifier>)>;

pub(crate) struct SpiffeClientCertVerifier {
    provider: Arc<dyn MaterialProvider>,
    authorizer: Arc<dyn Authorizer>,
    policy: TrustDomainPolicy,
    crypto: Arc<CryptoProvider>,
    // webpki verifiers per trust domain, rebuilt when the generation moves.
    cache: Mutex<ClientVerifierCache>,
}

impl SpiffeClientCertVerifier {
    pub(crate) fn new(
        provider: Arc<dyn MaterialProvider>,
        authorizer: Arc<dyn Authorizer>,
        policy: TrustDomainPolicy,
        crypto: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            provider,
            authorizer,
            policy,
            crypto,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn inner_for(&self, trust_domain: &TrustDomain) -> Result<Arc<dyn ClientCertVerifier>> {
        let snapshot = self.provider.current_material();
        let generation = snapshot.generation();

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| Error::VerifierBuilder("client verifier cache poisoned".into()))?;

        if let Some((cached_generation, verifier)) = cache.get(trust_domain) {
            if *cached_generation == generation {
                return Ok(verifier.clone());
            }
        }

        let roots = select_roots(&snapshot, &self.policy, trust_domain)?;
        let verifier = WebPkiClientVerifier::builder_with_provider(roots, self.crypto.clone())
            .build()
            .map_err(|e| Error::VerifierBuilder(e.to_string()))?;

        debug!(trust_domain = %trust_domain, generation, "built client certificate verifier");
        cache.insert(trust_domain.clone(), (generation, verifier.clone()));
        Ok(verifier)
    }
}

impl fmt::Debug for SpiffeClientCertVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpiffeClientCertVerifier")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ClientCertVerifier for SpiffeClientCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let spiffe_id = peer_spiffe_id(end_entity)?;
        let inner = self
            .inner_for(spiffe_id.trust_domain())
            .map_err(other_err)?;

        let verified = inner.verify_client_cert(end_entity, intermediates, now)?;

        authorize(&*self.authorizer, &spiffe_id)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.crypto
            .signature_verification_algorithms
            .supported_schemes()
    }
}
