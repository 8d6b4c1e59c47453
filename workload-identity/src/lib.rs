#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # workload-identity
//!
//! Identity plumbing shared by the ping-pong and AWS demo workloads.
//!
//! The crate talks to a local SPIFFE Workload API agent and turns what it hands
//! out into things the workloads can use directly:
//!
//! * an [`Agent`] handle for fetching and validating JWT-SVIDs,
//! * a [`MaterialWatcher`] that follows X.509-SVID and bundle rotation,
//! * rustls client and server configurations that present the current SVID,
//!   verify peers against SPIFFE trust bundles and authorize them by SPIFFE ID,
//! * a [`TlsAcceptor`] that reports the verified [`PeerIdentity`].
//!
//! ```no_run
//! use workload_identity::{authorizer, mtls_server, Agent, MaterialWatcher, TlsAcceptor};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let agent = Agent::connect_default().await?;
//! let watcher = MaterialWatcher::start(&agent, Vec::new()).await?;
//!
//! let server_config = mtls_server(watcher)
//!     .authorize(authorizer::path_segment("sa", "ping-pong-client"))
//!     .build()?;
//! let acceptor = TlsAcceptor::new(Arc::new(server_config));
//! # Ok(())
//! # }
//! ```

mod acceptor;
mod agent;
pub mod authorizer;
pub mod cert;
mod client;
mod crypto;
mod error;
mod jwt;
mod material;
mod peer;
mod policy;
mod server;
#[cfg(test)]
mod testing;
mod verifier;
mod watcher;

pub use acceptor::TlsAcceptor;
pub use agent::{
    Agent, TokenSource, TokenValidator, DEFAULT_AGENT_SOCKET, DEFAULT_AGENT_TIMEOUT,
    SPIFFE_ENDPOINT_SOCKET_ENV,
};
pub use authorizer::Authorizer;
pub use client::ClientConfigBuilder;
pub use crypto::ensure_crypto_provider_installed;
pub use error::{Error, Result};
pub use jwt::{bearer_token, JwtToken};
pub use material::{MaterialSnapshot, X509Material};
pub use peer::PeerIdentity;
pub use policy::TrustDomainPolicy;
pub use policy::TrustDomainPolicy::{AllowList, AnyInBundleSet, LocalOnly};
pub use server::ServerConfigBuilder;
pub use watcher::{MaterialPublisher, MaterialWatcher};

pub use spiffe::{SpiffeId, TrustDomain};

/// Starts a [`ClientConfigBuilder`] presenting the watcher's current SVID.
pub fn mtls_client(watcher: MaterialWatcher) -> ClientConfigBuilder {
    ClientConfigBuilder::new(watcher)
}

/// Starts a [`ServerConfigBuilder`] presenting the watcher's current SVID.
pub fn mtls_server(watcher: MaterialWatcher) -> ServerConfigBuilder {
    ServerConfigBuilder::new(watcher)
}
