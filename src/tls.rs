use std::sync::OnceLock;

/// Select the `ring` crypto provider for rustls once per process.
///
/// rustls 0.23 panics on first use when more than one provider is compiled in and none was
/// chosen. A provider installed elsewhere in the process wins; the error is ignored.
pub fn install_rustls_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
