use crate::authorizer::Authorizer;
use crate::error::Result;
use crate::policy::TrustDomainPolicy;
use crate::verifier::{MaterialProvider, SpiffeServerCertVerifier};
use crate::watcher::{CurrentSvid, MaterialWatcher};
use rustls::ClientConfig;
use std::sync::Arc;

/// Builds a [`rustls::ClientConfig`] for SVID-based mutual TLS.
///
/// The configuration presents the watcher's current SVID as client
/// certificate, verifies the server against the bundle of its trust domain and
/// authorizes it by SPIFFE ID. Rotated material is picked up by the next
/// handshake.
///
/// ```no_run
/// use workload_identity::{authorizer, mtls_client, Agent, MaterialWatcher};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let agent = Agent::connect_default().await?;
/// let watcher = MaterialWatcher::start(&agent, Vec::new()).await?;
/// let config = mtls_client(watcher)
///     .authorize(authorizer::exact(["spiffe://example.org/ns/production/sa/default"])?)
///     .with_alpn_protocols([b"http/1.1"])
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientConfigBuilder {
    watcher: MaterialWatcher,
    authorizer: Arc<dyn Authorizer>,
    trust_domain_policy: TrustDomainPolicy,
    alpn_protocols: Vec<Vec<u8>>,
}

impl std::fmt::Debug for ClientConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfigBuilder")
            .field("watcher", &self.watcher)
            .field("authorizer", &"<Arc<dyn Authorizer>>")
            .field("trust_domain_policy", &self.trust_domain_policy)
            .field("alpn_protocols", &self.alpn_protocols)
            .finish()
    }
}

impl ClientConfigBuilder {
    /// Creates a builder that authenticates any server from the bundle set.
    pub fn new(watcher: MaterialWatcher) -> Self {
        Self {
            watcher,
            authorizer: Arc::new(crate::authorizer::any()),
            trust_domain_policy: TrustDomainPolicy::default(),
            alpn_protocols: Vec::new(),
        }
    }

    /// Sets the authorization policy for server SPIFFE IDs.
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

    /// Builds the `rustls::ClientConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Rustls`] if the default protocol versions are
    /// not supported by the installed crypto provider.
    pub fn build(self) -> Result<ClientConfig> {
        let crypto = crate::crypto::provider();

        let svid = Arc::new(CurrentSvid(self.watcher.clone()));
        let verifier = Arc::new(SpiffeServerCertVerifier::new(
            Arc::new(self.watcher) as Arc<dyn MaterialProvider>,
            self.authorizer,
            self.trust_domain_policy,
            &crypto,
        ));

        let mut cfg = ClientConfig::builder_with_provider(crypto)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_cert_resolver(svid);

        cfg.alpn_protocols = self.alpn_protocols;

        Ok(cfg)
    }
}
