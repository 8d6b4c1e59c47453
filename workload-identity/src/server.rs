use crate::authorizer::Authorizer;
use crate::error::Result;
use crate::policy::TrustDomainPolicy;
use crate::verifier::{MaterialProvider, SpiffeClientCertVerifier};
use crate::watcher::{CurrentSvid, MaterialWatcher};
use rustls::ServerConfig;
use std::sync::Arc;

/// Builds a [`rustls::ServerConfig`] for SVID-based mutual TLS.
///
/// Clients must present an X.509-SVID that chains to the bundle of its trust
/// domain; the authorizer then decides on the client's SPIFFE ID. The server
/// presents the watcher's current SVID.
pub struct ServerConfigBuilder {
    watcher: MaterialWatcher,
    authorizer: Arc<dyn Authorizer>,
    trust_domain_policy: TrustDomainPolicy,
    alpn_protocols: Vec<Vec<u8>>,
}

impl std::fmt::Debug for ServerConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfigBuilder")
            .field("watcher", &self.watcher)
            .field("authorizer", &"<Arc<dyn Authorizer>>")
            .field("trust_domain_policy", &self.trust_domain_policy)
            .field("alpn_protocols", &self.alpn_protocols)
            .finish()
    }
}

impl ServerConfigBuilder {
    /// Creates a builder that accepts any authenticated client.
    pub fn new(watcher: MaterialWatcher) -> Self {
        Self {
            watcher,
            authorizer: Arc::new(crate::authorizer::any()),
            trust_domain_policy: TrustDomainPolicy::default(),
            alpn_protocols: Vec::new(),
        }
    }

    /// Sets the authorization policy for client SPIFFE IDs.
    #[must_use]
    pub fn authorize<A: Authorizer>(mut self, authorizer: A) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    /// Sets the trust domain policy.
    #[must_use]
    pub fn trust_domain_policy(mut self, policy: TrustDomainPolicy) -> Self {
        self.trust_domain_policy = policy;
        self
    }

    /// Sets the ALPN protocols, most preferred first.
    #[must_use]
    pub fn with_alpn_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        self.alpn_protocols = protocols.into_iter().map(|p| p.as_ref().to_vec()).collect();
        self
    }

    /// Builds the `rustls::ServerConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Rustls`] if the default protocol versions are
    /// not supported by the installed crypto provider.
    pub fn build(self) -> Result<ServerConfig> {
        let crypto = crate::crypto::provider();

        let svid = Arc::new(CurrentSvid(self.watcher.clone()));
        let verifier = Arc::new(SpiffeClientCertVerifier::new(
            Arc::new(self.watcher) as Arc<dyn MaterialProvider>,
            self.authorizer,
            self.trust_domain_policy,
            crypto.clone(),
        ));

        let mut cfg = ServerConfig::builder_with_provider(crypto)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_cert_resolver(svid);

        cfg.alpn_protocols = self.alpn_protocols;

        Ok(cfg)
    }
}
