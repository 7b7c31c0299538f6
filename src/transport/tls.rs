//! TLS client configuration shared by the socket and WebSocket backends

use std::sync::{Arc, OnceLock};

use tokio_rustls::rustls::{ClientConfig, RootCertStore};

/// Client config trusting the bundled web PKI roots.
///
/// Built once per process; certificate policy beyond this is rustls' concern.
pub fn client_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

    CONFIG
        .get_or_init(|| {
            // Pin the ring provider; fails harmlessly if one is already installed
            let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

            let roots = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            Arc::new(config)
        })
        .clone()
}
