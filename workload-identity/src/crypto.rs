use rustls::crypto::CryptoProvider;
use std::sync::{Arc, OnceLock};

/// Ensures a rustls crypto provider is installed as the process default.
///
/// Idempotent. If the application (or another crate) already installed a
/// provider, that one is kept.
///
/// Binaries that link both `ring` and `aws-lc-rs` (the AWS SDK pulls the
/// latter in) must call this before building any rustls config, otherwise
/// rustls cannot pick a default.
pub fn ensure_crypto_provider_installed() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Returns the process default provider, installing ring first if needed.
pub(crate) fn provider() -> Arc<CryptoProvider> {
    ensure_crypto_provider_installed();
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}
