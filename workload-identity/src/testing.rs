//! Certificate fixtures generated at test time.

use crate::material::X509Material;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::CertificateDer;
use spiffe::TrustDomain;

pub(crate) struct TestCa {
    trust_domain: String,
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestCa {
    pub(crate) fn new(trust_domain: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{trust_domain} test CA"));
        params
            .subject_alt_names
            .push(SanType::URI(format!("spiffe://{trust_domain}").try_into().unwrap()));

        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        Self {
            trust_domain: trust_domain.to_string(),
            cert,
            key,
        }
    }

    pub(crate) fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    /// Issues a leaf with the given URI SANs; returns (cert, PKCS#8 key).
    pub(crate) fn issue(&self, uris: &[&str]) -> (CertificateDer<'static>, Vec<u8>) {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.subject_alt_names = uris
            .iter()
            .map(|uri| SanType::URI((*uri).try_into().unwrap()))
            .collect();

        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();

        (cert.der().clone(), key.serialize_der())
    }

    pub(crate) fn trust_domain(&self) -> TrustDomain {
        TrustDomain::new(&self.trust_domain).unwrap()
    }

    /// A Workload API context holding one SVID for `id` and this CA's bundle.
    pub(crate) fn context(&self, id: &str) -> spiffe::X509Context {
        let (leaf, key) = self.issue(&[id]);
        let svid = spiffe::X509Svid::parse_from_der(&leaf, &key).unwrap();
        let mut bundles = spiffe::X509BundleSet::new();
        bundles.add_bundle(spiffe::X509Bundle::parse_from_der(self.trust_domain(), &self.der()).unwrap());
        spiffe::X509Context::new(vec![svid], bundles)
    }

    /// Material for `id` issued by this CA, trusting only this CA.
    pub(crate) fn material(&self, id: &str) -> X509Material {
        let (leaf, key) = self.issue(&[id]);
        X509Material::new(vec![leaf], key).with_bundle(self.trust_domain(), vec![self.der()])
    }
}
