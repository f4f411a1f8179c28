//! Mutating Admission Webhook for KubeVirt VirtualMachines
//!
//! Intercepts VirtualMachine create/update requests and enables nested
//! virtualization on VMs whose name matches a configured namespace rule.
//!
//! The webhook never denies. If anything goes wrong after the envelope has
//! been decoded, the object is admitted unchanged and the failure is
//! reported in the response status message.

pub mod virtual_machine;

use std::sync::Arc;

use axum::{routing::post, Router};

use crate::mutation::VmFeatureMutator;
use crate::rules::RuleSet;

pub use virtual_machine::{
    decode_review, decode_virtual_machine, mutate_handler, DecodeError, RawAdmission, WebhookError,
};

/// Path the MutatingWebhookConfiguration points at
pub const MUTATE_PATH: &str = "/mutate";

/// Shared state for webhook handlers
///
/// Read-only once built, so requests can run concurrently without locking.
#[derive(Debug, Clone)]
pub struct WebhookState {
    /// Namespace/name rules deciding which VMs are mutated
    pub rules: RuleSet,
    /// Injects the CPU feature into matching VMs
    pub mutator: VmFeatureMutator,
}

impl WebhookState {
    /// Create a new webhook state
    pub fn new(rules: RuleSet, mutator: VmFeatureMutator) -> Self {
        Self { rules, mutator }
    }
}

/// Create the webhook router
///
/// - POST /mutate - Mutate VirtualMachines matching the rule set
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MUTATE_PATH, post(mutate_handler))
        .with_state(state)
}
