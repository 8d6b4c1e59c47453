#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # workloads
//!
//! Shared plumbing for the ping-pong and AWS demo executables in `src/bin`.
//!
//! Every executable follows the same shape: read its configuration from flags
//! and environment variables ([`config`]), set up logging ([`telemetry`]),
//! optionally obtain an identity from the local SPIFFE agent, then either
//! serve requests ([`http::Server`]) or call a peer on a fixed period
//! ([`pingpong::run_every`]).

pub mod aws;
pub mod config;
mod error;
pub mod http;
pub mod jwt_auth;
pub mod metrics;
pub mod pingpong;
pub mod telemetry;
pub mod tls;

pub use error::{Error, Result};
