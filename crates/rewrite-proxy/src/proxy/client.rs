//! HTTP client used to reach the origin.

use super::tls::{install_crypto_provider, NoVerifier};
use crate::config::{OriginConfig, Protocol};
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Type alias for the HTTP client used by the proxy.
pub type HttpClient =
    Client<hyper_rustls::HttpsConnector<HttpConnector>, BoxBody<Bytes, hyper::Error>>;

/// Create the shared origin client with connection pooling.
///
/// Plain-HTTP origins go straight through the connector; HTTPS origins use
/// rustls with the platform's root store, or with verification disabled
/// when `tls_skip_verify` is set.
pub fn create_http_client(origin: &OriginConfig) -> HttpClient {
    install_crypto_provider();
    let pool = &origin.connection_pool;
    if origin.tls_skip_verify && origin.protocol() == Protocol::Http {
        debug!("origin.tls_skip_verify has no effect on an http origin");
    }

    let mut http_connector = HttpConnector::new();
    http_connector.set_keepalive(Some(Duration::from_secs(pool.keepalive_timeout_secs)));
    http_connector.set_connect_timeout(Some(Duration::from_secs(pool.connect_timeout_secs)));
    http_connector.enforce_http(false); // Allow both HTTP and HTTPS

    let builder = hyper_rustls::HttpsConnectorBuilder::new();
    let builder = if origin.tls_skip_verify {
        warn!("TLS certificate verification DISABLED for the origin (development/testing only)");
        builder.with_tls_config(
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth(),
        )
    } else {
        match builder.with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                warn!(
                    "Failed to load native root certificates ({}); HTTPS origins will fail verification",
                    e
                );
                hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(
                    rustls::ClientConfig::builder()
                        .with_root_certificates(rustls::RootCertStore::empty())
                        .with_no_client_auth(),
                )
            }
        }
    };
    let https_connector = builder
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector);

    let http_client = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(pool.idle_timeout_secs))
        .pool_max_idle_per_host(pool.max_idle_per_host)
        .build(https_connector);

    info!(
        "Connection pool configured (HTTP/1.1): max_idle={}, idle_timeout={}s, keepalive={}s",
        pool.max_idle_per_host, pool.idle_timeout_secs, pool.keepalive_timeout_secs
    );

    http_client
}
