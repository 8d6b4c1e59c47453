use std::time::Duration;

/// Result type used across this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while talking to the agent or building TLS material.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The Workload API call failed.
    #[error("workload API error: {0}")]
    WorkloadApi(String),

    /// The agent did not answer within the configured timeout.
    #[error("timed out after {0:?} waiting for the workload API")]
    Timeout(Duration),

    /// The X.509 context from the agent did not contain a default SVID.
    #[error("workload API returned no X.509 SVID")]
    NoSvid,

    /// No usable trust bundle for the given trust domain.
    #[error("no trust bundle for trust domain {0}")]
    NoBundle(String),

    /// The peer's trust domain is excluded by the trust domain policy.
    #[error("trust domain {0} is not allowed by policy")]
    TrustDomainNotAllowed(String),

    /// Failed to turn the SVID chain and key into a rustls `CertifiedKey`.
    #[error("failed building certified key: {0}")]
    CertifiedKey(String),

    /// A certificate could not be parsed.
    #[error("failed parsing certificate: {0}")]
    CertParse(String),

    /// The certificate carries no SPIFFE ID URI SAN.
    #[error("certificate is missing a SPIFFE ID URI SAN")]
    MissingSpiffeId,

    /// The certificate carries more than one SPIFFE ID URI SAN.
    #[error("certificate has more than one SPIFFE ID URI SAN")]
    MultipleSpiffeIds,

    /// A SPIFFE ID or trust domain string did not parse.
    #[error("invalid SPIFFE ID: {0}")]
    InvalidSpiffeId(String),

    /// The peer authenticated but its SPIFFE ID was rejected by the authorizer.
    #[error("unauthorized SPIFFE ID: {0}")]
    UnauthorizedSpiffeId(String),

    /// A webpki verifier could not be built from the trust bundle.
    #[error("failed building certificate verifier: {0}")]
    VerifierBuilder(String),

    /// A JWT-SVID could not be decoded.
    #[error("invalid JWT-SVID: {0}")]
    Jwt(String),

    /// rustls reported an error.
    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    /// I/O failure during the TLS handshake.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
