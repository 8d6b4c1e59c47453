use crate::cert;
use crate::error::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;
use spiffe::{
    BundleSource, SpiffeId, SvidSource, TrustDomain, X509Bundle, X509Context, X509Source, X509Svid,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Raw X.509 material: an SVID chain, its PKCS#8 key and trust bundles.
///
/// Usually built from a Workload API [`X509Context`], but can be assembled by
/// hand for static setups and tests.
#[derive(Clone)]
pub struct X509Material {
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: Vec<u8>,
    bundles: Vec<(TrustDomain, Vec<CertificateDer<'static>>)>,
}

impl fmt::Debug for X509Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509Material")
            .field("cert_chain_len", &self.cert_chain.len())
            .field("private_key", &"<redacted>")
            .field(
                "bundles",
                &self.bundles.iter().map(|(td, _)| td).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl X509Material {
    /// Creates material from a leaf-first chain and a PKCS#8 DER key.
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, private_key_pkcs8: Vec<u8>) -> Self {
        Self {
            cert_chain,
            private_key: private_key_pkcs8,
            bundles: Vec::new(),
        }
    }

    /// Adds the X.509 authorities trusted for `trust_domain`.
    #[must_use]
    pub fn with_bundle(
        mut self,
        trust_domain: TrustDomain,
        authorities: Vec<CertificateDer<'static>>,
    ) -> Self {
        self.bundles.push((trust_domain, authorities));
        self
    }

    /// Picks the default SVID from a Workload API context together with the
    /// bundle of its own trust domain and of each federated trust domain.
    ///
    /// # Errors
    ///
    /// See [`X509Material::from_source`].
    pub fn from_context(context: &X509Context, federated: &[TrustDomain]) -> Result<Self> {
        Self::from_source(context, federated)
    }

    /// Reads the current SVID and the bundles for its own and the federated
    /// trust domains out of `source`.
    ///
    /// A federated trust domain without a bundle is skipped.
    ///
    /// # Errors
    ///
    /// [`Error::NoSvid`] when the source has no SVID, [`Error::NoBundle`]
    /// when the SVID's own trust domain has no bundle.
    pub(crate) fn from_source<S: X509MaterialSource + ?Sized>(
        source: &S,
        federated: &[TrustDomain],
    ) -> Result<Self> {
        let svid = source.current_svid()?.ok_or(Error::NoSvid)?;

        let cert_chain = svid
            .cert_chain()
            .iter()
            .map(|c| CertificateDer::from(c.content().to_vec()))
            .collect();
        let mut material = Self::new(cert_chain, svid.private_key().content().to_vec());

        let local = svid.spiffe_id().trust_domain().clone();
        let wanted = std::iter::once(&local).chain(federated.iter().filter(|td| **td != local));

        for td in wanted {
            match source.bundle_for(td)? {
                Some(bundle) => {
                    let authorities = bundle
                        .authorities()
                        .iter()
                        .map(|c| CertificateDer::from(c.content().to_vec()))
                        .collect();
                    material = material.with_bundle(td.clone(), authorities);
                }
                None if *td == local => return Err(Error::NoBundle(td.to_string())),
                None => warn!(trust_domain = %td, "no bundle for federated trust domain; skipping"),
            }
        }

        Ok(material)
    }

    /// Returns the leaf certificate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSvid`] if the chain is empty.
    pub fn leaf(&self) -> Result<&CertificateDer<'static>> {
        self.cert_chain.first().ok_or(Error::NoSvid)
    }
}

/// Where SVIDs and bundles are read from: a one-shot context or a live
/// [`X509Source`].
pub(crate) trait X509MaterialSource {
    fn current_svid(&self) -> Result<Option<X509Svid>>;
    fn bundle_for(&self, trust_domain: &TrustDomain) -> Result<Option<X509Bundle>>;
}

impl X509MaterialSource for X509Context {
    fn current_svid(&self) -> Result<Option<X509Svid>> {
        Ok(self.default_svid().cloned())
    }

    fn bundle_for(&self, trust_domain: &TrustDomain) -> Result<Option<X509Bundle>> {
        Ok(self.bundle_set().get_bundle(trust_domain).cloned())
    }
}

impl X509MaterialSource for X509Source {
    fn current_svid(&self) -> Result<Option<X509Svid>> {
        <X509Source as SvidSource>::get_svid(self).map_err(|e| Error::WorkloadApi(e.to_string()))
    }

    fn bundle_for(&self, trust_domain: &TrustDomain) -> Result<Option<X509Bundle>> {
        <X509Source as BundleSource>::get_bundle_for_trust_domain(self, trust_domain)
            .map_err(|e| Error::WorkloadApi(e.to_string()))
    }
}

/// rustls-ready view of one [`X509Material`] generation.
#[derive(Clone)]
pub struct MaterialSnapshot {
    generation: u64,
    spiffe_id: SpiffeId,
    not_after: i64,
    certified_key: Arc<CertifiedKey>,
    roots: HashMap<TrustDomain, Arc<RootCertStore>>,
}

impl fmt::Debug for MaterialSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterialSnapshot")
            .field("generation", &self.generation)
            .field("spiffe_id", &self.spiffe_id)
            .field("not_after", &self.not_after)
            .field("trust_domains", &self.roots.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl MaterialSnapshot {
    /// Builds the snapshot for `generation`.
    ///
    /// # Errors
    ///
    /// Fails if the leaf has no single SPIFFE ID, the key does not load, or a
    /// bundle contributes no usable root. The SVID's own trust domain must
    /// have a bundle.
    pub fn build(generation: u64, material: &X509Material) -> Result<Self> {
        let leaf = material.leaf()?;
        let spiffe_id = cert::spiffe_id_from_der(leaf.as_ref())?;
        let not_after = cert::not_after(leaf.as_ref())?;

        let certified_key =
            certified_key_from_chain_and_key(material.cert_chain.clone(), &material.private_key)?;

        let mut roots = HashMap::with_capacity(material.bundles.len());
        for (td, authorities) in &material.bundles {
            roots.insert(td.clone(), roots_from_certs(td, authorities)?);
        }

        if !roots.contains_key(spiffe_id.trust_domain()) {
            return Err(Error::NoBundle(spiffe_id.trust_domain().to_string()));
        }

        Ok(Self {
            generation,
            spiffe_id,
            not_after,
            certified_key,
            roots,
        })
    }

    /// Monotonic counter bumped on every rotation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// SPIFFE ID of our own SVID.
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// Expiry of our own leaf certificate, seconds since the Unix epoch.
    pub fn not_after(&self) -> i64 {
        self.not_after
    }

    /// Trust domains with a usable root store.
    pub fn trust_domains(&self) -> impl Iterator<Item = &TrustDomain> {
        self.roots.keys()
    }

    pub(crate) fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified_key
    }

    pub(crate) fn roots_for(&self, trust_domain: &TrustDomain) -> Option<&Arc<RootCertStore>> {
        self.roots.get(trust_domain)
    }
}

fn roots_from_certs(
    trust_domain: &TrustDomain,
    certs: &[CertificateDer<'static>],
) -> Result<Arc<RootCertStore>> {
    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(certs.iter().cloned());

    debug!(trust_domain = %trust_domain, added, ignored, "loaded bundle roots");

    if store.is_empty() {
        return Err(Error::NoBundle(trust_domain.to_string()));
    }

    Ok(Arc::new(store))
}

fn certified_key_from_chain_and_key(
    cert_chain: Vec<CertificateDer<'static>>,
    private_key_pkcs8_der: &[u8],
) -> Result<Arc<CertifiedKey>> {
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(private_key_pkcs8_der.to_vec()));

    let signing_key = crate::crypto::provider()
        .key_provider
        .load_private_key(key_der)
        .map_err(|e| Error::CertifiedKey(e.to_string()))?;

    Ok(Arc::new(CertifiedKey::new(cert_chain, signing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestCa;

    #[test]
    fn builds_snapshot_for_own_trust_domain() {
        let ca = TestCa::new("example.org");
        let material = ca.material("spiffe://example.org/ns/demo/sa/server");

        let snap = MaterialSnapshot::build(7, &material).unwrap();

        assert_eq!(snap.generation(), 7);
        assert_eq!(
            snap.spiffe_id().to_string(),
            "spiffe://example.org/ns/demo/sa/server"
        );
        assert!(snap.roots_for(&ca.trust_domain()).is_some());
        assert!(!snap.certified_key().cert.is_empty());
        assert!(snap.not_after() > 0);
    }

    #[test]
    fn keeps_federated_roots() {
        let local = TestCa::new("example.org");
        let remote = TestCa::new("partner.org");
        let material = local
            .material("spiffe://example.org/svc")
            .with_bundle(remote.trust_domain(), vec![remote.der()]);

        let snap = MaterialSnapshot::build(1, &material).unwrap();

        assert!(snap.roots_for(&remote.trust_domain()).is_some());
        assert_eq!(snap.trust_domains().count(), 2);
    }

    #[test]
    fn rejects_missing_own_bundle() {
        let ca = TestCa::new("example.org");
        let other = TestCa::new("partner.org");
        let (leaf, key) = ca.issue(&["spiffe://example.org/svc"]);
        let material =
            X509Material::new(vec![leaf], key).with_bundle(other.trust_domain(), vec![other.der()]);

        let err = MaterialSnapshot::build(1, &material).unwrap_err();
        assert!(matches!(err, Error::NoBundle(td) if td == "example.org"));
    }

    #[test]
    fn reads_workload_api_context() {
        let ca = TestCa::new("example.org");
        let context = ca.context("spiffe://example.org/ns/demo/sa/server");

        let material = X509Material::from_context(&context, &[]).unwrap();
        let snap = MaterialSnapshot::build(1, &material).unwrap();

        assert_eq!(
            snap.spiffe_id().to_string(),
            "spiffe://example.org/ns/demo/sa/server"
        );
        assert_eq!(material.leaf().unwrap().as_ref(), context.default_svid().unwrap().leaf().content());
        assert!(snap.roots_for(&ca.trust_domain()).is_some());
    }

    #[test]
    fn context_skips_missing_federated_bundle() {
        let ca = TestCa::new("example.org");
        let context = ca.context("spiffe://example.org/svc");
        let partner = TrustDomain::new("partner.org").unwrap();

        let material = X509Material::from_context(&context, &[partner.clone()]).unwrap();
        let snap = MaterialSnapshot::build(1, &material).unwrap();

        assert!(snap.roots_for(&partner).is_none());
        assert_eq!(snap.trust_domains().count(), 1);
    }

    #[test]
    fn context_without_svid_is_rejected() {
        let context = X509Context::new(Vec::new(), spiffe::X509BundleSet::new());
        assert!(matches!(
            X509Material::from_context(&context, &[]),
            Err(Error::NoSvid)
        ));
    }

    #[test]
    fn rejects_empty_chain() {
        let material = X509Material::new(Vec::new(), Vec::new());
        assert!(matches!(
            MaterialSnapshot::build(1, &material),
            Err(Error::NoSvid)
        ));
    }

    #[test]
    fn rejects_unparsable_bundle() {
        let ca = TestCa::new("example.org");
        let (leaf, key) = ca.issue(&["spiffe://example.org/svc"]);
        let material = X509Material::new(vec![leaf], key)
            .with_bundle(ca.trust_domain(), vec![CertificateDer::from(vec![1, 2, 3])]);

        assert!(matches!(
            MaterialSnapshot::build(1, &material),
            Err(Error::NoBundle(_))
        ));
    }

    #[test]
    fn rejects_bad_key() {
        let ca = TestCa::new("example.org");
        let (leaf, _) = ca.issue(&["spiffe://example.org/svc"]);
        let material = X509Material::new(vec![leaf], vec![0; 8])
            .with_bundle(ca.trust_domain(), vec![ca.der()]);

        assert!(matches!(
            MaterialSnapshot::build(1, &material),
            Err(Error::CertifiedKey(_))
        ));
    }

    #[test]
    fn debug_redacts_key() {
        let ca = TestCa::new("example.org");
        let material = ca.material("spiffe://example.org/svc");
        assert!(format!("{material:?}").contains("<redacted>"));
    }
}
