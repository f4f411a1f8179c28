//! Startup wiring for the webhook binary
//!
//! Loads settings, assembles the rule set from the settings file and the
//! rules ConfigMap, then serves until shutdown. Every step reports through
//! [`crate::Error`].

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{self, Overrides, Settings};
use crate::mutation::VmFeatureMutator;
use crate::rules::RuleSet;
use crate::server::{self, ServerConfig};
use crate::webhook::WebhookState;
use crate::Result;

/// Resolve settings from an optional file plus overrides
pub fn load_settings(path: Option<&Path>, overrides: &Overrides) -> Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    Ok(settings.merge_overrides(overrides))
}

/// File rules followed by the ConfigMap rules, if a ConfigMap is configured
pub async fn load_rules(settings: &Settings, kubeconfig: Option<&Path>) -> Result<RuleSet> {
    let mut rules = settings.rules();
    if let Some(reference) = &settings.configmap {
        let client = config::create_client(kubeconfig).await?;
        rules.extend(config::fetch_configmap_rules(client, reference).await?);
    }

    if rules.is_empty() {
        warn!("No rules configured, every VirtualMachine will be admitted unchanged");
    }
    for rule in rules.rules() {
        info!(
            namespace = %rule.namespace(),
            patterns = rule.patterns().len(),
            "Loaded rule"
        );
    }
    Ok(rules)
}

/// Serve the webhook with `rules` until a shutdown signal arrives
pub async fn run(settings: &Settings, rules: RuleSet) -> Result<()> {
    let mutator = VmFeatureMutator::new(settings.build_detector());
    let state = Arc::new(WebhookState::new(rules, mutator));

    let (cert_file, key_file) = settings.tls_paths();
    server::serve(ServerConfig::new(settings.port, cert_file, key_file), state).await?;
    Ok(())
}
