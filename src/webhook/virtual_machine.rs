//! VirtualMachine Mutation Webhook
//!
//! Handles AdmissionReview requests for KubeVirt VirtualMachines, injecting
//! the host's virtualization CPU feature into VMs matched by the rule set.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    DynamicObject,
};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::kubevirt::VirtualMachine;
use crate::patch::{self, PatchError};
use crate::scheme;

use super::WebhookState;

/// Error type for failures that abort the HTTP exchange
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The admission review envelope was invalid or malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            WebhookError::InvalidReview(_) => (StatusCode::BAD_REQUEST, self.to_string()),
        };

        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// The embedded object could not be read as a VirtualMachine
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The request carries no object (e.g. DELETE)
    #[error("request carries no object")]
    MissingObject,

    /// The request or object is of a kind this webhook does not handle
    #[error("unsupported kind {0}")]
    UnsupportedKind(String),

    /// The object does not fit the VirtualMachine schema
    #[error("{0}")]
    Schema(#[from] serde_json::Error),
}

/// An admission request whose embedded object is still raw JSON
///
/// The object is split off before the envelope is decoded so that a badly
/// shaped object can never fail the exchange itself.
#[derive(Debug, Clone)]
pub struct RawAdmission {
    /// The decoded request, with `object`/`oldObject` emptied
    pub request: AdmissionRequest<DynamicObject>,
    /// `request.object` exactly as received
    pub object: Option<Value>,
}

/// Decode an AdmissionReview body
///
/// Only the envelope is validated here: bad JSON or a missing `request` is
/// a [`WebhookError`]. The embedded object is returned untouched.
pub fn decode_review(body: &[u8]) -> Result<RawAdmission, WebhookError> {
    let mut envelope: Value = serde_json::from_slice(body).map_err(|e| {
        error!(error = %e, "Failed to decode admission review");
        WebhookError::InvalidReview(format!("failed to decode admission review: {e}"))
    })?;

    let object = take_embedded_objects(&mut envelope);

    let review: AdmissionReview<DynamicObject> = serde_json::from_value(envelope).map_err(|e| {
        error!(error = %e, "Failed to decode admission review");
        WebhookError::InvalidReview(format!("failed to decode admission review: {e}"))
    })?;

    let request: AdmissionRequest<DynamicObject> = review.try_into().map_err(|_| {
        error!("Admission review has no request");
        WebhookError::InvalidReview("admission review request is nil".to_string())
    })?;

    Ok(RawAdmission { request, object })
}

/// Detach `object` and drop `oldObject` from the request, leaving nulls
fn take_embedded_objects(envelope: &mut Value) -> Option<Value> {
    let request = envelope.get_mut("request")?.as_object_mut()?;
    if let Some(old) = request.get_mut("oldObject") {
        *old = Value::Null;
    }
    request
        .get_mut("object")
        .map(Value::take)
        .filter(|object| !object.is_null())
}

/// Handle mutating admission review for VirtualMachines
///
/// Envelope problems (bad JSON, no `request`) fail the exchange with 400.
/// Everything after that produces an allowed AdmissionReview response.
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    body: Bytes,
) -> Result<Json<AdmissionReview<DynamicObject>>, WebhookError> {
    let admission = decode_review(&body)?;
    let response = state.review(&admission);
    Ok(Json(response.into_review()))
}

impl WebhookState {
    /// Decide on a single admission request
    ///
    /// Always returns an allowed response carrying the request UID.
    pub fn review(&self, admission: &RawAdmission) -> AdmissionResponse {
        let request = &admission.request;
        let uid = request.uid.as_str();
        let namespace = request.namespace.as_deref().unwrap_or_default();

        let vm = match decode_virtual_machine(admission) {
            Ok(vm) => vm,
            Err(e) => {
                warn!(
                    uid = %uid,
                    namespace = %namespace,
                    error = %e,
                    "Failed to decode VirtualMachine, allowing unchanged"
                );
                return allow_with_message(request, format!("failed to decode VirtualMachine: {e}"));
            }
        };

        if !self.rules.matches(namespace, vm.name()) {
            debug!(
                uid = %uid,
                namespace = %namespace,
                vm = %vm.name(),
                "VirtualMachine does not match any rule, allowing unchanged"
            );
            return AdmissionResponse::from(request);
        }

        let mut mutated = vm.clone();
        if let Err(e) = self.mutator.apply(&mut mutated) {
            error!(
                uid = %uid,
                namespace = %namespace,
                vm = %vm.name(),
                error = %e,
                "Failed to mutate VirtualMachine"
            );
            return allow_with_message(request, format!("failed to mutate VirtualMachine: {e}"));
        }

        let patch = match build_patch(&vm, &mutated) {
            Ok(Some(patch)) => patch,
            Ok(None) => {
                debug!(
                    uid = %uid,
                    vm = %vm.name(),
                    "CPU feature already present, nothing to patch"
                );
                return AdmissionResponse::from(request);
            }
            Err(e) => {
                error!(uid = %uid, vm = %vm.name(), error = %e, "Failed to create JSON patch");
                return allow_with_message(request, format!("failed to create JSON patch: {e}"));
            }
        };

        info!(
            uid = %uid,
            namespace = %namespace,
            vm = %vm.name(),
            "Enabling nested virtualization on VirtualMachine"
        );

        match AdmissionResponse::from(request).with_patch(patch) {
            Ok(response) => response,
            Err(e) => {
                error!(uid = %uid, error = %e, "Failed to serialize patch");
                allow_with_message(request, format!("failed to create JSON patch: {e}"))
            }
        }
    }
}

/// Read the raw request object as a KubeVirt VirtualMachine
///
/// Every object-level problem, including a non-object value or badly typed
/// metadata, is a [`DecodeError`].
pub fn decode_virtual_machine(admission: &RawAdmission) -> Result<VirtualMachine, DecodeError> {
    let registry = scheme::registry();
    let kind = &admission.request.kind;

    if !registry.is_virtual_machine(kind) {
        return Err(DecodeError::UnsupportedKind(format!(
            "{}/{} {}",
            kind.group, kind.version, kind.kind
        )));
    }

    let object = admission.object.as_ref().ok_or(DecodeError::MissingObject)?;

    let api_version = object.get("apiVersion").and_then(Value::as_str);
    let object_kind = object.get("kind").and_then(Value::as_str);
    if let (Some(api_version), Some(object_kind)) = (api_version, object_kind) {
        if !registry.is_virtual_machine_type(api_version, object_kind) {
            return Err(DecodeError::UnsupportedKind(format!(
                "{} {}",
                api_version, object_kind
            )));
        }
    }

    Ok(VirtualMachine::deserialize(object)?)
}

/// Serialize both versions and diff the CPU features path
fn build_patch(
    original: &VirtualMachine,
    mutated: &VirtualMachine,
) -> Result<Option<json_patch::Patch>, PatchError> {
    let original = serde_json::to_vec(original)?;
    let mutated = serde_json::to_vec(mutated)?;
    patch::diff_documents(&original, &mutated)
}

/// Soft-allow: admit unchanged but say why nothing was done
fn allow_with_message(
    request: &AdmissionRequest<DynamicObject>,
    message: String,
) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request);
    response.result.message = message;
    response
}
