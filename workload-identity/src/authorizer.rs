//! Deciding which authenticated peers a workload will talk to.

use crate::error::{Error, Result};
use spiffe::{SpiffeId, TrustDomain};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Authorization policy for peer SPIFFE IDs.
///
/// Runs only after the peer's chain verified against a trust bundle.
pub trait Authorizer: Send + Sync + 'static {
    /// Returns `true` if the peer SPIFFE ID is authorized.
    fn authorize(&self, peer: &SpiffeId) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&SpiffeId) -> bool + Send + Sync + 'static,
{
    fn authorize(&self, peer: &SpiffeId) -> bool {
        self(peer)
    }
}

impl Authorizer for Arc<dyn Authorizer> {
    fn authorize(&self, peer: &SpiffeId) -> bool {
        (**self).authorize(peer)
    }
}

/// Accepts any SPIFFE ID (authentication only).
#[derive(Debug, Clone, Copy, Default)]
pub struct Any;

impl Authorizer for Any {
    fn authorize(&self, _peer: &SpiffeId) -> bool {
        true
    }
}

/// Accepts only the listed SPIFFE IDs.
#[derive(Debug, Clone)]
pub struct Exact {
    allowed: Arc<BTreeSet<SpiffeId>>,
}

impl Exact {
    /// Creates an allow-list. An empty list authorizes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSpiffeId`] if any ID does not parse.
    pub fn new<I>(ids: I) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: TryInto<SpiffeId>,
        <I::Item as TryInto<SpiffeId>>::Error: std::fmt::Display,
    {
        let allowed = ids
            .into_iter()
            .map(|id| {
                id.try_into()
                    .map_err(|e| Error::InvalidSpiffeId(e.to_string()))
            })
            .collect::<Result<BTreeSet<_>>>()?;

        Ok(Self {
            allowed: Arc::new(allowed),
        })
    }
}

impl Authorizer for Exact {
    fn authorize(&self, peer: &SpiffeId) -> bool {
        self.allowed.contains(peer)
    }
}

/// Accepts any SPIFFE ID that belongs to one of the listed trust domains.
#[derive(Debug, Clone)]
pub struct TrustDomains {
    allowed: Arc<BTreeSet<TrustDomain>>,
}

impl TrustDomains {
    /// Creates the authorizer. An empty list authorizes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSpiffeId`] if any trust domain does not parse.
    pub fn new<I>(domains: I) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: TryInto<TrustDomain>,
        <I::Item as TryInto<TrustDomain>>::Error: std::fmt::Display,
    {
        let allowed = domains
            .into_iter()
            .map(|td| {
                td.try_into()
                    .map_err(|e| Error::InvalidSpiffeId(e.to_string()))
            })
            .collect::<Result<BTreeSet<_>>>()?;

        Ok(Self {
            allowed: Arc::new(allowed),
        })
    }
}

impl Authorizer for TrustDomains {
    fn authorize(&self, peer: &SpiffeId) -> bool {
        self.allowed.contains(peer.trust_domain())
    }
}

/// Accepts IDs whose path contains `key` immediately followed by `value`.
///
/// Kubernetes-style SVIDs look like `spiffe://td/ns/<namespace>/sa/<account>`,
/// so `PathSegment::new("sa", "ping-pong-client")` authorizes that service
/// account in any namespace.
#[derive(Debug, Clone)]
pub struct PathSegment {
    key: String,
    value: String,
}

impl PathSegment {
    /// Creates a matcher for the `key/value` pair.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Authorizer for PathSegment {
    fn authorize(&self, peer: &SpiffeId) -> bool {
        let segments: Vec<&str> = peer.path().split('/').filter(|s| !s.is_empty()).collect();
        segments
            .windows(2)
            .any(|pair| pair[0] == self.key && pair[1] == self.value)
    }
}

/// Returns an authorizer that accepts any SPIFFE ID.
pub fn any() -> Any {
    Any
}

/// Returns an authorizer that accepts exactly the given SPIFFE IDs.
///
/// ```rust
/// use workload_identity::authorizer;
///
/// let auth = authorizer::exact(["spiffe://example.org/ns/demo/sa/ping-pong-client"])?;
/// # Ok::<(), workload_identity::Error>(())
/// ```
///
/// # Errors
///
/// Returns [`Error::InvalidSpiffeId`] if any ID is invalid.
pub fn exact<I>(ids: I) -> Result<Exact>
where
    I: IntoIterator,
    I::Item: TryInto<SpiffeId>,
    <I::Item as TryInto<SpiffeId>>::Error: std::fmt::Display,
{
    Exact::new(ids)
}

/// Returns an authorizer that accepts any ID from the given trust domains.
///
/// # Errors
///
/// Returns [`Error::InvalidSpiffeId`] if any trust domain is invalid.
pub fn trust_domains<I>(domains: I) -> Result<TrustDomains>
where
    I: IntoIterator,
    I::Item: TryInto<TrustDomain>,
    <I::Item as TryInto<TrustDomain>>::Error: std::fmt::Display,
{
    TrustDomains::new(domains)
}

/// Returns an authorizer matching a `key/value` pair in the ID path.
pub fn path_segment(key: impl Into<String>, value: impl Into<String>) -> PathSegment {
    PathSegment::new(key, value)
}
