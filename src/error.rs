//! Error types for the nested virtualization webhook

use thiserror::Error;

use crate::config::ConfigError;
use crate::rules::RuleError;
use crate::server::ServerError;

/// Startup error type
///
/// Per-request failures never reach this type: the webhook reports them in
/// the admission response instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Settings could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A matching rule could not be compiled
    #[error(transparent)]
    Rule(#[from] RuleError),

    /// HTTPS server failure
    #[error(transparent)]
    Server(#[from] ServerError),

    /// Kubernetes client configuration error
    #[error("client configuration error: {0}")]
    ClientConfig(String),

    /// The referenced rules ConfigMap does not exist
    #[error("rules ConfigMap {namespace}/{name} not found")]
    ConfigMapNotFound {
        /// ConfigMap name
        name: String,
        /// ConfigMap namespace
        namespace: String,
    },
}

impl Error {
    /// Create a client configuration error with the given message
    pub fn client_config(msg: impl Into<String>) -> Self {
        Self::ClientConfig(msg.into())
    }
}
