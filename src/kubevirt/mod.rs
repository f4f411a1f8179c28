//! KubeVirt VirtualMachine schema (kubevirt.io/v1)
//!
//! Only the path down to `spec.template.spec.domain.cpu.features` is typed.
//! Every level carries a flattened map of the fields we do not model, so an
//! object decoded here re-serializes without losing data.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// API group of KubeVirt core resources
pub const KUBEVIRT_GROUP: &str = "kubevirt.io";

/// Storage API version for VirtualMachines
pub const KUBEVIRT_VERSION: &str = "v1";

/// Every served VirtualMachine version; the CPU features path is identical
/// in all of them
pub const KUBEVIRT_SERVED_VERSIONS: [&str; 2] = [KUBEVIRT_VERSION, "v1alpha3"];

/// Kind name of the VirtualMachine resource
pub const VIRTUAL_MACHINE_KIND: &str = "VirtualMachine";

/// A KubeVirt VirtualMachine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    /// `kubevirt.io/v1`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// `VirtualMachine`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Standard object metadata
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: ObjectMeta,
    /// Desired state
    #[serde(default, deserialize_with = "null_as_default")]
    pub spec: VirtualMachineSpec,
    /// Everything else (status, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `VirtualMachine.spec`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Template for the VirtualMachineInstance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<VirtualMachineInstanceTemplateSpec>,
    /// Unmodelled fields (runStrategy, dataVolumeTemplates, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `VirtualMachine.spec.template`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceTemplateSpec {
    /// VMI spec
    #[serde(default, deserialize_with = "null_as_default")]
    pub spec: VirtualMachineInstanceSpec,
    /// Unmodelled fields (metadata, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `VirtualMachine.spec.template.spec`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    /// Virtual hardware
    #[serde(default, deserialize_with = "null_as_default")]
    pub domain: DomainSpec,
    /// Unmodelled fields (volumes, networks, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `VirtualMachine.spec.template.spec.domain`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    /// CPU topology and features
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Cpu>,
    /// Unmodelled fields (devices, resources, memory, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `domain.cpu`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    /// Requested CPU features
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub features: Vec<CpuFeatureSpec>,
    /// Unmodelled fields (cores, sockets, model, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One entry of `domain.cpu.features`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuFeatureSpec {
    /// Feature name, e.g. `vmx`
    pub name: String,
    /// `force`, `require`, `optional`, `disable` or `forbid`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy: String,
}

impl CpuFeatureSpec {
    /// Feature entry with an explicit policy
    pub fn new(name: impl Into<String>, policy: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: policy.into(),
        }
    }
}

/// Explicit `null` decodes like an absent field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl VirtualMachine {
    /// Object name, empty if unset
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// CPU features currently requested, if the path exists
    pub fn cpu_features(&self) -> Option<&[CpuFeatureSpec]> {
        self.spec
            .template
            .as_ref()?
            .spec
            .domain
            .cpu
            .as_ref()
            .map(|cpu| cpu.features.as_slice())
    }
}
