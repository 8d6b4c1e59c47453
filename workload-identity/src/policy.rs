//! Which trust bundles may be used to verify a peer.

use spiffe::TrustDomain;
use std::collections::BTreeSet;

/// Restricts the trust domains whose bundles verify peers.
///
/// When federation is configured the agent hands out bundles for several trust
/// domains. The verifier selects a bundle from the peer's SPIFFE ID, then asks
/// this policy whether that trust domain is acceptable at all.
#[derive(Debug, Clone, Default)]
pub enum TrustDomainPolicy {
    /// Use every bundle in the current material.
    #[default]
    AnyInBundleSet,

    /// Only these trust domains.
    AllowList(BTreeSet<TrustDomain>),

    /// Only this one trust domain.
    LocalOnly(TrustDomain),
}

impl TrustDomainPolicy {
    /// Checks if a trust domain is allowed by this policy.
    pub fn allows(&self, trust_domain: &TrustDomain) -> bool {
        match self {
            Self::AnyInBundleSet => true,
            Self::AllowList(allowed) => allowed.contains(trust_domain),
            Self::LocalOnly(local) => trust_domain == local,
        }
    }
}
