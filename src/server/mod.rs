//! HTTPS server for the admission webhook
//!
//! Serves the webhook router plus a health endpoint over TLS. Request
//! headers must arrive within [`HEADER_READ_TIMEOUT`] and each request must
//! complete within [`REQUEST_TIMEOUT`]. The listener runs until SIGINT or
//! SIGTERM, then drains in-flight requests for up to
//! [`SHUTDOWN_GRACE_PERIOD`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use hyper_util::rt::TokioTimer;
use thiserror::Error;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info};

use crate::webhook::{webhook_router, WebhookState};

/// Health check path
pub const HEALTHZ_PATH: &str = "/healthz";

/// Deadline for a client to finish sending request headers
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for reading the body, handling and writing the response
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long in-flight requests may run after a shutdown signal
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Certificate or key could not be loaded
    #[error("Failed to configure TLS from {cert} and {key}: {source}")]
    TlsConfig {
        /// Certificate path
        cert: PathBuf,
        /// Private key path
        key: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The listener failed to bind or stopped with an error
    #[error("HTTPS server error on {addr}: {source}")]
    Serve {
        /// Listen address
        addr: SocketAddr,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub addr: SocketAddr,
    /// PEM certificate chain
    pub cert_file: PathBuf,
    /// PEM private key
    pub key_file: PathBuf,
}

impl ServerConfig {
    /// Listen on all interfaces at `port`
    pub fn new(port: u16, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        }
    }
}

/// Health check handler
async fn healthz() -> &'static str {
    "ok"
}

/// Full application router
///
/// - POST /mutate - Webhook endpoint
/// - GET /healthz - Liveness/readiness probe
///
/// Every route answers 408 once [`REQUEST_TIMEOUT`] elapses.
pub fn app_router(state: Arc<WebhookState>) -> Router {
    with_request_timeout(
        webhook_router(state).route(HEALTHZ_PATH, get(healthz)),
        REQUEST_TIMEOUT,
    )
}

/// Bound every request on `router` by `timeout`
pub fn with_request_timeout(router: Router, timeout: Duration) -> Router {
    router.layer(TimeoutLayer::new(timeout))
}

/// Serve the webhook over TLS until a shutdown signal arrives
pub async fn serve(config: ServerConfig, state: Arc<WebhookState>) -> Result<(), ServerError> {
    let tls_config = RustlsConfig::from_pem_file(&config.cert_file, &config.key_file)
        .await
        .map_err(|source| ServerError::TlsConfig {
            cert: config.cert_file.clone(),
            key: config.key_file.clone(),
            source,
        })?;

    let handle = Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone()));

    let mut server = axum_server::bind_rustls(config.addr, tls_config).handle(handle);
    server
        .http_builder()
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);

    info!(addr = %config.addr, "Starting webhook HTTPS server");
    server
        .serve(app_router(state).into_make_service())
        .await
        .map_err(|source| ServerError::Serve {
            addr: config.addr,
            source,
        })?;

    info!("Webhook server stopped");
    Ok(())
}

async fn shutdown_on_signal(handle: Handle) {
    shutdown_signal().await;
    info!(
        grace_period_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
        "Shutting down webhook server"
    );
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{CpuFeature, StaticFeatureDetector};
    use crate::mutation::VmFeatureMutator;
    use crate::rules::RuleSet;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> Arc<WebhookState> {
        Arc::new(WebhookState::new(
            RuleSet::default(),
            VmFeatureMutator::new(Arc::new(StaticFeatureDetector::new(CpuFeature::Vmx))),
        ))
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let request = Request::builder()
            .method("GET")
            .uri(HEALTHZ_PATH)
            .body(Body::empty())
            .unwrap();

        let response = app_router(state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn app_router_still_serves_mutate() {
        let request = Request::builder()
            .method("POST")
            .uri("/mutate")
            .body(Body::from("not json"))
            .unwrap();

        let response = app_router(state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let request = Request::builder()
            .method("GET")
            .uri("/nope")
            .body(Body::empty())
            .unwrap();

        let response = app_router(state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn slow_requests_time_out() {
        let slow = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let router = with_request_timeout(slow, Duration::from_millis(20));

        let request = Request::builder()
            .method("GET")
            .uri("/slow")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn timeouts_match_listener_contract() {
        assert_eq!(HEADER_READ_TIMEOUT, Duration::from_secs(10));
        assert_eq!(REQUEST_TIMEOUT, Duration::from_secs(30));
        assert!(SHUTDOWN_GRACE_PERIOD >= REQUEST_TIMEOUT);
    }

    #[test]
    fn server_config_listens_on_all_interfaces() {
        let config = ServerConfig::new(8443, "/certs/tls.crt", "/certs/tls.key");
        assert_eq!(config.addr.to_string(), "0.0.0.0:8443");
        assert_eq!(config.cert_file, PathBuf::from("/certs/tls.crt"));
    }

    #[tokio::test]
    async fn serve_fails_on_missing_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::new(
            0,
            dir.path().join("tls.crt"),
            dir.path().join("tls.key"),
        );

        let err = serve(config, state()).await.unwrap_err();
        assert!(matches!(err, ServerError::TlsConfig { .. }));
        assert!(err.to_string().contains("tls.crt"));
    }
}
