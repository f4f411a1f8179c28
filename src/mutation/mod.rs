//! VirtualMachine CPU feature injection
//!
//! [`VmFeatureMutator`] asks its [`FeatureDetector`] which virtualization
//! extension the host has and makes sure the VM requires it. Running it
//! twice never produces a duplicate entry.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::detect::{DetectError, FeatureDetector};
use crate::kubevirt::{CpuFeatureSpec, VirtualMachine};
use crate::FEATURE_POLICY_REQUIRE;

/// Errors raised while mutating a VirtualMachine
#[derive(Debug, Error)]
pub enum MutationError {
    /// The feature detector failed; the VM was left untouched
    #[error("failed to detect CPU feature: {0}")]
    Detection(#[from] DetectError),
}

/// Injects the host's virtualization feature into VirtualMachines
#[derive(Clone)]
pub struct VmFeatureMutator {
    detector: Arc<dyn FeatureDetector>,
}

impl VmFeatureMutator {
    /// Create a mutator using the given detector
    pub fn new(detector: Arc<dyn FeatureDetector>) -> Self {
        Self { detector }
    }

    /// Ensure the detected feature is present with policy `require`
    ///
    /// Detection happens before anything is touched, so on error the VM is
    /// unchanged. Missing `template`/`cpu` structures are created empty.
    /// Existing features keep their order; a feature that is already listed
    /// (under any policy) is left as is.
    pub fn apply(&self, vm: &mut VirtualMachine) -> Result<(), MutationError> {
        let feature = self.detector.detect()?;

        let features = &mut vm
            .spec
            .template
            .get_or_insert_with(Default::default)
            .spec
            .domain
            .cpu
            .get_or_insert_with(Default::default)
            .features;

        if features.iter().any(|f| f.name == feature.as_str()) {
            debug!(vm = ?vm.metadata.name, feature = %feature, "CPU feature already present");
            return Ok(());
        }

        features.push(CpuFeatureSpec::new(feature.as_str(), FEATURE_POLICY_REQUIRE));
        debug!(vm = ?vm.metadata.name, feature = %feature, "Added CPU feature");
        Ok(())
    }
}

impl std::fmt::Debug for VmFeatureMutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmFeatureMutator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{CpuFeature, MockFeatureDetector, StaticFeatureDetector};
    use crate::kubevirt::{Cpu, VirtualMachineInstanceTemplateSpec};

    fn mutator(feature: CpuFeature) -> VmFeatureMutator {
        VmFeatureMutator::new(Arc::new(StaticFeatureDetector::new(feature)))
    }

    fn failing_mutator() -> VmFeatureMutator {
        let mut detector = MockFeatureDetector::new();
        detector
            .expect_detect()
            .returning(|| Err(DetectError::NoVirtualizationFeature));
        VmFeatureMutator::new(Arc::new(detector))
    }

    fn vm_with_features(features: Vec<CpuFeatureSpec>) -> VirtualMachine {
        let mut vm = VirtualMachine::default();
        vm.metadata.name = Some("vm-test-123".to_string());
        let mut template = VirtualMachineInstanceTemplateSpec::default();
        template.spec.domain.cpu = Some(Cpu {
            features,
            ..Default::default()
        });
        vm.spec.template = Some(template);
        vm
    }

    // =========================================================================
    // Story Tests
    // =========================================================================

    /// Story: A bare VM gets the whole path created
    #[test]
    fn story_vm_without_template_gets_feature() {
        let mut vm = VirtualMachine::default();
        mutator(CpuFeature::Vmx).apply(&mut vm).unwrap();

        assert_eq!(
            vm.cpu_features().unwrap(),
            &[CpuFeatureSpec::new("vmx", "require")]
        );
    }

    /// Story: A VM with a template but no cpu section gets one
    #[test]
    fn story_vm_without_cpu_gets_feature() {
        let mut vm = VirtualMachine::default();
        vm.spec.template = Some(VirtualMachineInstanceTemplateSpec::default());

        mutator(CpuFeature::Svm).apply(&mut vm).unwrap();

        assert_eq!(
            vm.cpu_features().unwrap(),
            &[CpuFeatureSpec::new("svm", "require")]
        );
    }

    /// Story: Existing features are kept and the new one goes last
    #[test]
    fn story_existing_features_are_preserved_in_order() {
        let mut vm = vm_with_features(vec![
            CpuFeatureSpec::new("pcid", "require"),
            CpuFeatureSpec::new("ssbd", "optional"),
        ]);

        mutator(CpuFeature::Vmx).apply(&mut vm).unwrap();

        assert_eq!(
            vm.cpu_features().unwrap(),
            &[
                CpuFeatureSpec::new("pcid", "require"),
                CpuFeatureSpec::new("ssbd", "optional"),
                CpuFeatureSpec::new("vmx", "require"),
            ]
        );
    }

    /// Story: Re-admitting the same VM does not duplicate the feature
    #[test]
    fn story_mutation_is_idempotent() {
        let mutator = mutator(CpuFeature::Vmx);
        let mut once = VirtualMachine::default();
        mutator.apply(&mut once).unwrap();

        let mut twice = once.clone();
        mutator.apply(&mut twice).unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.cpu_features().unwrap().len(), 1);
    }

    /// Story: A feature listed under another policy is not touched
    #[test]
    fn story_present_feature_keeps_its_policy() {
        let mut vm = vm_with_features(vec![CpuFeatureSpec::new("vmx", "optional")]);
        mutator(CpuFeature::Vmx).apply(&mut vm).unwrap();

        assert_eq!(
            vm.cpu_features().unwrap(),
            &[CpuFeatureSpec::new("vmx", "optional")]
        );
    }

    /// Story: Detection failure leaves the VM byte-for-byte unchanged
    #[test]
    fn story_detection_failure_leaves_vm_untouched() {
        let mut vm = VirtualMachine::default();
        vm.metadata.name = Some("vm-1".to_string());
        let before = vm.clone();

        let err = failing_mutator().apply(&mut vm).unwrap_err();

        assert!(matches!(err, MutationError::Detection(_)));
        assert!(err
            .to_string()
            .contains("no virtualization feature (vmx or svm) found in CPU info"));
        assert_eq!(vm, before);
        assert!(vm.spec.template.is_none());
    }

    #[test]
    fn detector_is_consulted_once_per_apply() {
        let mut detector = MockFeatureDetector::new();
        detector
            .expect_detect()
            .times(2)
            .returning(|| Ok(CpuFeature::Svm));
        let mutator = VmFeatureMutator::new(Arc::new(detector));

        let mut vm = VirtualMachine::default();
        mutator.apply(&mut vm).unwrap();
        mutator.apply(&mut vm).unwrap();
        assert_eq!(vm.cpu_features().unwrap().len(), 1);
    }
}
