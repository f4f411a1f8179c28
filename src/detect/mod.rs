//! CPU virtualization feature detection
//!
//! The webhook injects whichever hardware virtualization extension the host
//! exposes: `vmx` on Intel VT-x, `svm` on AMD-V. Detection sits behind the
//! [`FeatureDetector`] trait so deployments (and tests) can substitute a
//! fixed answer instead of reading host state.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by feature detectors
#[derive(Debug, Error)]
pub enum DetectError {
    /// The capability source could not be read
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// Path that was read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The host exposes neither VT-x nor AMD-V
    #[error("no virtualization feature (vmx or svm) found in CPU info")]
    NoVirtualizationFeature,
}

/// Hardware virtualization extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuFeature {
    /// Intel VT-x
    Vmx,
    /// AMD-V
    Svm,
}

impl CpuFeature {
    /// Feature name as used in cpuinfo and in the KubeVirt CPU spec
    pub fn as_str(&self) -> &'static str {
        match self {
            CpuFeature::Vmx => "vmx",
            CpuFeature::Svm => "svm",
        }
    }
}

impl fmt::Display for CpuFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CpuFeature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vmx" => Ok(CpuFeature::Vmx),
            "svm" => Ok(CpuFeature::Svm),
            other => Err(format!(
                "unknown CPU feature '{}', expected 'vmx' or 'svm'",
                other
            )),
        }
    }
}

/// Source of the CPU feature to inject
///
/// Implementations must be safe to call concurrently from many requests.
#[cfg_attr(test, automock)]
pub trait FeatureDetector: Send + Sync {
    /// Determine the virtualization feature for this host
    fn detect(&self) -> Result<CpuFeature, DetectError>;
}

// =============================================================================
// Host Implementation
// =============================================================================

/// Detector reading `/proc/cpuinfo` style capability text
#[derive(Debug, Clone)]
pub struct HostFeatureDetector {
    cpuinfo_path: PathBuf,
}

impl HostFeatureDetector {
    /// Detector reading the default `/proc/cpuinfo`
    pub fn new() -> Self {
        Self::with_path(crate::DEFAULT_CPUINFO_PATH)
    }

    /// Detector reading an alternate capability file
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            cpuinfo_path: path.into(),
        }
    }

    /// Path this detector reads
    pub fn path(&self) -> &Path {
        &self.cpuinfo_path
    }
}

impl Default for HostFeatureDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureDetector for HostFeatureDetector {
    fn detect(&self) -> Result<CpuFeature, DetectError> {
        let cpuinfo =
            std::fs::read_to_string(&self.cpuinfo_path).map_err(|source| DetectError::Io {
                path: self.cpuinfo_path.clone(),
                source,
            })?;
        parse_cpuinfo(&cpuinfo).ok_or(DetectError::NoVirtualizationFeature)
    }
}

/// Find the virtualization feature in cpuinfo text
///
/// Only `flags` (x86) and `Features` (ARM) lines are considered, and flags
/// must appear as whole whitespace-separated tokens: `svm_lock` is not `svm`.
/// `vmx` wins over `svm` on the same line.
pub fn parse_cpuinfo(cpuinfo: &str) -> Option<CpuFeature> {
    cpuinfo
        .lines()
        .filter_map(flag_tokens)
        .find_map(|tokens| {
            let tokens: Vec<&str> = tokens.collect();
            [CpuFeature::Vmx, CpuFeature::Svm]
                .into_iter()
                .find(|feature| tokens.contains(&feature.as_str()))
        })
}

fn flag_tokens(line: &str) -> Option<std::str::SplitWhitespace<'_>> {
    let (key, value) = line.split_once(':')?;
    match key.trim_end() {
        "flags" | "Features" => Some(value.split_whitespace()),
        _ => None,
    }
}

// =============================================================================
// Static Implementation
// =============================================================================

/// Detector that always reports the same feature
///
/// Used when the operator pins the feature in configuration, e.g. on nodes
/// where the webhook pod does not see the hypervisor's CPU flags.
#[derive(Debug, Clone, Copy)]
pub struct StaticFeatureDetector {
    feature: CpuFeature,
}

impl StaticFeatureDetector {
    /// Create a detector that always returns `feature`
    pub fn new(feature: CpuFeature) -> Self {
        Self { feature }
    }
}

impl FeatureDetector for StaticFeatureDetector {
    fn detect(&self) -> Result<CpuFeature, DetectError> {
        Ok(self.feature)
    }
}
