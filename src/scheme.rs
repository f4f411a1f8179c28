//! Process-wide registry of object kinds the webhook understands
//!
//! Built on first access and never mutated afterwards. `main` touches it
//! before the listener starts so request handlers only ever read it.

use std::sync::OnceLock;

use kube::core::admission::{META_API_VERSION_V1, META_KIND};
use kube::core::GroupVersionKind;

use crate::kubevirt::{KUBEVIRT_GROUP, KUBEVIRT_SERVED_VERSIONS, VIRTUAL_MACHINE_KIND};

static REGISTRY: OnceLock<SchemeRegistry> = OnceLock::new();

/// Read-only set of recognized GroupVersionKinds
#[derive(Debug)]
pub struct SchemeRegistry {
    kinds: Vec<GroupVersionKind>,
    virtual_machines: Vec<GroupVersionKind>,
}

impl SchemeRegistry {
    fn build() -> Self {
        let virtual_machines: Vec<_> = KUBEVIRT_SERVED_VERSIONS
            .iter()
            .map(|version| GroupVersionKind::gvk(KUBEVIRT_GROUP, version, VIRTUAL_MACHINE_KIND))
            .collect();
        let (admission_group, admission_version) = META_API_VERSION_V1
            .split_once('/')
            .unwrap_or(("admission.k8s.io", "v1"));
        let admission_review =
            GroupVersionKind::gvk(admission_group, admission_version, META_KIND);

        let mut kinds = virtual_machines.clone();
        kinds.push(admission_review);
        Self {
            kinds,
            virtual_machines,
        }
    }

    /// Whether the kind is known to this webhook
    pub fn recognizes(&self, gvk: &GroupVersionKind) -> bool {
        self.kinds.contains(gvk)
    }

    /// Whether the kind is a kubevirt.io VirtualMachine in a served version
    pub fn is_virtual_machine(&self, gvk: &GroupVersionKind) -> bool {
        self.virtual_machines.contains(gvk)
    }

    /// Whether an object's `apiVersion`/`kind` pair names a VirtualMachine
    pub fn is_virtual_machine_type(&self, api_version: &str, kind: &str) -> bool {
        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        self.is_virtual_machine(&GroupVersionKind::gvk(group, version, kind))
    }

    /// Number of registered kinds
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether no kinds are registered
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

/// The process-wide registry, built on first use
pub fn registry() -> &'static SchemeRegistry {
    REGISTRY.get_or_init(SchemeRegistry::build)
}
