//! Nested virtualization webhook for KubeVirt VirtualMachines
//!
//! A mutating admission webhook that intercepts VirtualMachine create/update
//! requests and, for VMs whose name matches a configured per-namespace
//! pattern, injects the host's virtualization CPU feature (`vmx` or `svm`)
//! with policy `require`.
//!
//! # Pipeline
//!
//! decode → match → clone → mutate → diff → respond
//!
//! The webhook never denies an object. Internal failures are reported in the
//! response status message and the object is admitted unchanged.
//!
//! # Modules
//!
//! - [`rules`] - Namespace → name pattern matching
//! - [`detect`] - CPU virtualization feature detection
//! - [`kubevirt`] - The subset of the KubeVirt VirtualMachine schema we touch
//! - [`scheme`] - Process-wide registry of recognized object kinds
//! - [`mutation`] - Idempotent CPU feature injection
//! - [`patch`] - Fixed-path JSON Patch synthesis
//! - [`webhook`] - AdmissionReview handling and routing
//! - [`server`] - HTTPS listener lifecycle
//! - [`config`] - Settings file, environment and CLI overrides
//! - [`startup`] - Settings, rules and listener wiring for the binary
//! - [`error`] - Error types for the webhook

#![deny(missing_docs)]

pub mod config;
pub mod detect;
pub mod error;
pub mod kubevirt;
pub mod mutation;
pub mod patch;
pub mod rules;
pub mod scheme;
pub mod server;
pub mod startup;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default port for the webhook HTTPS server
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;

/// Default directory holding `tls.crt` and `tls.key`
pub const DEFAULT_CERT_DIR: &str = "/etc/webhook/certs";

/// Default host capability source read by the CPU feature detector
pub const DEFAULT_CPUINFO_PATH: &str = "/proc/cpuinfo";

/// Default name of the rules ConfigMap
pub const DEFAULT_CONFIGMAP_NAME: &str = "nested-virt-config";

/// Default namespace for the rules ConfigMap
pub const DEFAULT_CONFIGMAP_NAMESPACE: &str = "default";

/// Policy attached to injected CPU features
pub const FEATURE_POLICY_REQUIRE: &str = "require";
