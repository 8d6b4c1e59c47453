//! TLS setups used by the executables: SVID mTLS through
//! `workload-identity`, static certificates from PEM files, and plain HTTPS
//! clients.

use crate::error::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use workload_identity::{Authorizer, MaterialWatcher, TlsAcceptor};

const SERVER_ALPN: [&[u8]; 2] = [b"h2", b"http/1.1"];
const CLIENT_ALPN: [&[u8]; 1] = [b"http/1.1"];

/// Server side of SVID mTLS: presents the watcher's SVID and requires a
/// client SVID that `authorizer` accepts.
///
/// # Errors
///
/// Fails if the rustls configuration cannot be built.
pub fn mtls_acceptor<A: Authorizer>(watcher: MaterialWatcher, authorizer: A) -> Result<TlsAcceptor> {
    let config = workload_identity::mtls_server(watcher)
        .authorize(authorizer)
        .with_alpn_protocols(SERVER_ALPN)
        .build()?;
    Ok(TlsAcceptor::new(Arc::new(config)))
}

/// Client side of SVID mTLS as a `reqwest` client.
///
/// The server is verified against the SPIFFE bundle of its trust domain and
/// must be accepted by `authorizer`; host names play no part.
///
/// # Errors
///
/// Fails if the rustls configuration or the client cannot be built.
pub fn mtls_http_client<A: Authorizer>(
    watcher: MaterialWatcher,
    authorizer: A,
) -> Result<reqwest::Client> {
    let config = workload_identity::mtls_client(watcher)
        .authorize(authorizer)
        .with_alpn_protocols(CLIENT_ALPN)
        .build()?;

    let client = reqwest::Client::builder()
        .use_preconfigured_tls(config)
        .build()?;
    Ok(client)
}

/// A `reqwest` client for `http://` and publicly trusted `https://` URLs.
///
/// With `insecure_skip_verify` the server certificate is not checked at all.
///
/// # Errors
///
/// Fails if the client cannot be built.
pub fn http_client(insecure_skip_verify: bool) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(insecure_skip_verify)
        .build()?;
    Ok(client)
}

/// Returns `true` when both files exist.
pub fn files_exist(cert_path: &Path, key_path: &Path) -> bool {
    cert_path.is_file() && key_path.is_file()
}

/// Builds a server configuration from a PEM certificate chain and key.
///
/// No client certificate is requested.
///
/// # Errors
///
/// [`Error::TlsFiles`] if a file cannot be read or holds no certificate or
/// key, [`Error::Rustls`] if rustls rejects the pair.
pub fn server_config_from_pem(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = SERVER_ALPN.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| tls_files(path, &e))?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_files(path, &e))?;

    if certs.is_empty() {
        return Err(tls_files(path, &"no certificates found"));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| tls_files(path, &e))?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_files(path, &e))?
        .ok_or_else(|| tls_files(path, &"no private key found"))
}

fn tls_files(path: &Path, reason: &dyn std::fmt::Display) -> Error {
    Error::TlsFiles {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn pem_pair() -> (NamedTempFile, NamedTempFile) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let mut cert_file = NamedTempFile::new().unwrap();
        cert_file.write_all(cert.pem().as_bytes()).unwrap();
        let mut key_file = NamedTempFile::new().unwrap();
        key_file.write_all(key_pair.serialize_pem().as_bytes()).unwrap();
        (cert_file, key_file)
    }

    #[test]
    fn loads_pem_files() {
        let (cert, key) = pem_pair();
        assert!(files_exist(cert.path(), key.path()));

        let config = server_config_from_pem(cert.path(), key.path()).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn missing_files() {
        let (cert, _) = pem_pair();
        let missing = cert.path().with_extension("missing");
        assert!(!files_exist(cert.path(), &missing));
        assert!(matches!(
            server_config_from_pem(cert.path(), &missing),
            Err(Error::TlsFiles { .. })
        ));
    }

    #[test]
    fn key_file_without_key() {
        let (cert, _) = pem_pair();
        let err = server_config_from_pem(cert.path(), cert.path()).unwrap_err();
        assert!(err.to_string().contains("no private key found"), "{err}");
    }
}
