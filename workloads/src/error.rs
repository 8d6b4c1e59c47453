use std::io;

/// Result alias used across the workloads.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the demo workloads.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Identity plumbing failed (agent, SVID material, TLS configuration).
    #[error(transparent)]
    Identity(#[from] workload_identity::Error),

    /// A configured SPIFFE ID does not parse.
    #[error("invalid SPIFFE ID {id:?}: {reason}")]
    InvalidSpiffeId {
        /// The offending value after template expansion.
        id: String,
        /// Parser message.
        reason: String,
    },

    /// Transport-level failure of an outgoing request.
    #[error(transparent)]
    Request(#[from] reqwest::Error),

    /// The consumer could not be reached.
    #[error("error connecting to {address:?}: {source}")]
    Connect {
        /// Base address that was called.
        address: String,
        /// Transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The peer answered with something other than `200 OK`.
    #[error("unexpected status code: {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, lossily decoded.
        body: String,
    },

    /// The consumer reported a failure while listing buckets.
    #[error("error from server: {0}")]
    Server(String),

    /// The JWT server answered without its own bearer token.
    #[error("no token provided by server")]
    MissingServerToken,

    /// The server's bearer token failed validation.
    #[error("invalid server token: {0}")]
    InvalidServerToken(#[source] workload_identity::Error),

    /// The server's token is valid but names an unexpected workload.
    #[error("invalid server ID: {0}")]
    UnexpectedServerId(String),

    /// Reading TLS files from disk failed or they hold no usable material.
    #[error("TLS material in {path}: {reason}")]
    TlsFiles {
        /// File that failed.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// Building a TLS configuration failed.
    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    /// `AWS_ROLE_ARN` is not configured.
    #[error("AWS_ROLE_ARN environment variable not set")]
    MissingRoleArn,

    /// A call to AWS failed.
    #[error("{context}: {message}")]
    Aws {
        /// Operation that failed.
        context: &'static str,
        /// SDK error text.
        message: String,
    },

    /// A metric could not be created or registered.
    #[error(transparent)]
    Metrics(#[from] prometheus::Error),

    /// Socket or file I/O.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn aws(context: &'static str, err: impl std::error::Error) -> Self {
        Self::Aws {
            context,
            message: aws_error_message(&err),
        }
    }
}

// SDK errors keep the useful part in the source chain.
fn aws_error_message(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] io::Error);

    #[test]
    fn aws_errors_include_source_chain() {
        let err = Error::aws(
            "unable to list S3 buckets",
            Outer(io::Error::new(io::ErrorKind::Other, "access denied")),
        );
        assert_eq!(err.to_string(), "unable to list S3 buckets: outer: access denied");
    }

    #[test]
    fn status_message_matches_client_log() {
        let err = Error::UnexpectedStatus {
            status: 401,
            body: "Invalid client ID".into(),
        };
        assert_eq!(err.to_string(), "unexpected status code: 401: Invalid client ID");
    }
}
