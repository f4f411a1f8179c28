//! Webhook settings
//!
//! Settings are resolved in three layers, lowest priority first:
//! 1. Built-in defaults
//! 2. An optional YAML settings file (`--config`)
//! 3. Environment variables and command-line flags
//!
//! Rules can come from the settings file and from a Kubernetes ConfigMap.
//! File rules are compiled leniently (a bad pattern is logged and skipped);
//! ConfigMap rules are compiled strictly (a bad pattern is a startup error).
//!
//! The ConfigMap `nested-virt-config` in `default` is read unless the
//! settings file sets `configmap: null` or `--disable-configmap` is given.
//! A referenced ConfigMap that does not exist stops startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::detect::{CpuFeature, FeatureDetector, HostFeatureDetector, StaticFeatureDetector};
use crate::rules::{CompilePolicy, NamespaceRuleConfig, RuleError, RuleSet};
use crate::{
    DEFAULT_CERT_DIR, DEFAULT_CONFIGMAP_NAME, DEFAULT_CONFIGMAP_NAMESPACE, DEFAULT_CPUINFO_PATH,
    DEFAULT_WEBHOOK_PORT,
};

/// Certificate file name inside the cert directory
pub const TLS_CERT_FILE: &str = "tls.crt";

/// Private key file name inside the cert directory
pub const TLS_KEY_FILE: &str = "tls.key";

/// Errors raised while loading settings
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings file could not be read
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// Settings file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The settings file is not valid YAML for [`Settings`]
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        /// Settings file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_yaml::Error,
    },
}

/// Location of the rules ConfigMap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMapRef {
    /// ConfigMap name
    pub name: String,
    /// ConfigMap namespace
    #[serde(default = "default_configmap_namespace")]
    pub namespace: String,
}

fn default_configmap_namespace() -> String {
    DEFAULT_CONFIGMAP_NAMESPACE.to_string()
}

impl Default for ConfigMapRef {
    fn default() -> Self {
        Self {
            name: DEFAULT_CONFIGMAP_NAME.to_string(),
            namespace: default_configmap_namespace(),
        }
    }
}

/// Resolved webhook settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    /// HTTPS listen port
    pub port: u16,
    /// Directory holding `tls.crt` and `tls.key`
    pub cert_dir: PathBuf,
    /// Explicit certificate path, overrides `cert_dir`
    pub cert_file: Option<PathBuf>,
    /// Explicit private key path, overrides `cert_dir`
    pub key_file: Option<PathBuf>,
    /// Verbose logging
    pub debug: bool,
    /// Emit logs as JSON
    pub log_json: bool,
    /// Host capability source for feature detection
    pub cpuinfo_path: PathBuf,
    /// Pin the injected feature instead of reading the host
    pub cpu_feature: Option<CpuFeature>,
    /// ConfigMap to load additional rules from, `None` to skip it
    pub configmap: Option<ConfigMapRef>,
    /// Rules defined inline
    pub rules: Vec<NamespaceRuleConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: DEFAULT_WEBHOOK_PORT,
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
            cert_file: None,
            key_file: None,
            debug: false,
            log_json: false,
            cpuinfo_path: PathBuf::from(DEFAULT_CPUINFO_PATH),
            cpu_feature: None,
            configmap: Some(ConfigMapRef::default()),
            rules: Vec::new(),
        }
    }
}

/// Values from the environment or command line
///
/// `None` (or `false` for switches) means "not given" and never clears a
/// value from the settings file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `--port`
    pub port: Option<u16>,
    /// `--cert-dir`
    pub cert_dir: Option<PathBuf>,
    /// `--cert-file`
    pub cert_file: Option<PathBuf>,
    /// `--key-file`
    pub key_file: Option<PathBuf>,
    /// `--debug`
    pub debug: bool,
    /// `--log-json`
    pub log_json: bool,
    /// `--cpuinfo-path`
    pub cpuinfo_path: Option<PathBuf>,
    /// `--cpu-feature`
    pub cpu_feature: Option<CpuFeature>,
    /// `--configmap-name`
    pub configmap_name: Option<String>,
    /// `--configmap-namespace`
    pub configmap_namespace: Option<String>,
    /// `--disable-configmap`, wins over the ConfigMap options
    pub disable_configmap: bool,
}

impl Settings {
    /// Read settings from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Loaded settings file");
        Ok(settings)
    }

    /// Apply environment/CLI overrides on top of these settings
    pub fn merge_overrides(mut self, overrides: &Overrides) -> Self {
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(dir) = &overrides.cert_dir {
            self.cert_dir = dir.clone();
        }
        if let Some(file) = &overrides.cert_file {
            self.cert_file = Some(file.clone());
        }
        if let Some(file) = &overrides.key_file {
            self.key_file = Some(file.clone());
        }
        self.debug |= overrides.debug;
        self.log_json |= overrides.log_json;
        if let Some(path) = &overrides.cpuinfo_path {
            self.cpuinfo_path = path.clone();
        }
        if let Some(feature) = overrides.cpu_feature {
            self.cpu_feature = Some(feature);
        }

        if let Some(name) = &overrides.configmap_name {
            let namespace = self
                .configmap
                .take()
                .map(|cm| cm.namespace)
                .unwrap_or_else(default_configmap_namespace);
            self.configmap = Some(ConfigMapRef {
                name: name.clone(),
                namespace,
            });
        }
        if let (Some(namespace), Some(cm)) = (&overrides.configmap_namespace, &mut self.configmap) {
            cm.namespace = namespace.clone();
        }
        if overrides.disable_configmap {
            self.configmap = None;
        }

        self
    }

    /// Certificate and key paths
    ///
    /// Explicit files win; otherwise `tls.crt`/`tls.key` under `cert_dir`.
    pub fn tls_paths(&self) -> (PathBuf, PathBuf) {
        let cert = self
            .cert_file
            .clone()
            .unwrap_or_else(|| self.cert_dir.join(TLS_CERT_FILE));
        let key = self
            .key_file
            .clone()
            .unwrap_or_else(|| self.cert_dir.join(TLS_KEY_FILE));
        (cert, key)
    }

    /// Feature detector selected by these settings
    pub fn build_detector(&self) -> Arc<dyn FeatureDetector> {
        match self.cpu_feature {
            Some(feature) => {
                info!(feature = %feature, "Using pinned CPU feature");
                Arc::new(StaticFeatureDetector::new(feature))
            }
            None => Arc::new(HostFeatureDetector::with_path(self.cpuinfo_path.clone())),
        }
    }

    /// Compile the inline rules, skipping invalid patterns
    pub fn rules(&self) -> RuleSet {
        RuleSet::from_rule_configs_lenient(&self.rules)
    }
}

/// Compile rules from a ConfigMap
///
/// A ConfigMap without `data` yields an empty rule set.
pub fn rules_from_configmap(configmap: &ConfigMap) -> Result<RuleSet, RuleError> {
    let empty = BTreeMap::new();
    let data = configmap.data.as_ref().unwrap_or(&empty);
    RuleSet::from_configmap_data(data, CompilePolicy::Strict)
}

/// Create a kube client from an optional kubeconfig path
///
/// Without a path the in-cluster or default kubeconfig is inferred.
pub async fn create_client(kubeconfig: Option<&Path>) -> crate::Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                crate::Error::client_config(format!("failed to read kubeconfig: {}", e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    crate::Error::client_config(format!("failed to load kubeconfig: {}", e))
                })?
        }
        None => Config::infer().await.map_err(|e| {
            crate::Error::client_config(format!("failed to infer config: {}", e))
        })?,
    };
    Ok(Client::try_from(config)?)
}

/// Fetch the referenced ConfigMap and compile its rules
pub async fn fetch_configmap_rules(
    client: Client,
    reference: &ConfigMapRef,
) -> crate::Result<RuleSet> {
    let api: Api<ConfigMap> = Api::namespaced(client, &reference.namespace);
    let configmap = require_configmap(api.get_opt(&reference.name).await?, reference)?;

    let rules = rules_from_configmap(&configmap)?;
    info!(
        name = %reference.name,
        namespace = %reference.namespace,
        rules = rules.len(),
        "Loaded rules from ConfigMap"
    );
    Ok(rules)
}

fn require_configmap(
    configmap: Option<ConfigMap>,
    reference: &ConfigMapRef,
) -> crate::Result<ConfigMap> {
    configmap.ok_or_else(|| crate::Error::ConfigMapNotFound {
        name: reference.name.clone(),
        namespace: reference.namespace.clone(),
    })
}
