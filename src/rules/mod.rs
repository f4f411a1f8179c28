//! Namespace-scoped VirtualMachine name matching
//!
//! A [`RuleSet`] maps namespaces to ordered lists of compiled regular
//! expressions. A VM matches when any rule for its namespace has a pattern
//! that finds a match anywhere in the VM name. Patterns are used exactly as
//! authored: `vm-` matches `my-vm-1` unless the author anchors it.
//!
//! Rules come from two sources with different compile policies:
//! - ConfigMap data (`namespace: "re1, re2"`) is parsed [`CompilePolicy::Strict`]
//! - The settings file (`rules: [{namespace, patterns}]`) is parsed
//!   [`CompilePolicy::Lenient`]

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Errors raised while compiling matching rules
#[derive(Debug, Error)]
pub enum RuleError {
    /// A pattern failed to compile under the strict policy
    #[error("invalid regex pattern '{pattern}' for namespace '{namespace}': {reason}")]
    InvalidPattern {
        /// Namespace the pattern was configured for
        namespace: String,
        /// The offending pattern after trimming
        pattern: String,
        /// Compiler diagnostic
        reason: String,
    },
}

/// What to do with a pattern that fails to compile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilePolicy {
    /// Abort construction with [`RuleError::InvalidPattern`]
    Strict,
    /// Log a warning, drop the pattern and keep the rest
    Lenient,
}

/// Raw rule as written in the settings file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRuleConfig {
    /// Namespace the patterns apply to
    pub namespace: String,
    /// Uncompiled patterns
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// A namespace with its compiled VM name patterns
///
/// Patterns are always valid and never empty.
#[derive(Debug, Clone)]
pub struct NamespaceRule {
    namespace: String,
    patterns: Vec<Regex>,
}

impl NamespaceRule {
    /// Namespace this rule applies to
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Compiled patterns in configuration order
    pub fn patterns(&self) -> &[Regex] {
        &self.patterns
    }

    fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(name))
    }
}

/// Ordered, immutable set of namespace rules
///
/// The default (empty) set never matches, so callers holding no
/// configuration do not need a separate code path.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<NamespaceRule>,
}

impl RuleSet {
    /// Parse ConfigMap-style data: each value is a comma-separated pattern list
    ///
    /// Empty values are ignored. Keys are processed in sorted order so the
    /// resulting rule order is deterministic.
    pub fn from_configmap_data(
        data: &BTreeMap<String, String>,
        policy: CompilePolicy,
    ) -> Result<Self, RuleError> {
        let mut set = Self::default();
        for (namespace, patterns) in data {
            set.push(namespace, patterns.split(','), policy)?;
        }
        Ok(set)
    }

    /// Compile structured rules from the settings file
    pub fn from_rule_configs(
        configs: &[NamespaceRuleConfig],
        policy: CompilePolicy,
    ) -> Result<Self, RuleError> {
        let mut set = Self::default();
        for config in configs {
            set.push(
                &config.namespace,
                config.patterns.iter().map(String::as_str),
                policy,
            )?;
        }
        Ok(set)
    }

    /// Compile structured rules, logging and skipping invalid patterns
    pub fn from_rule_configs_lenient(configs: &[NamespaceRuleConfig]) -> Self {
        let mut set = Self::default();
        for config in configs {
            let patterns = compile_lenient(
                &config.namespace,
                config.patterns.iter().map(String::as_str),
            );
            set.push_compiled(&config.namespace, patterns);
        }
        set
    }

    /// Append all rules of `other` after the rules already present
    pub fn extend(&mut self, other: RuleSet) {
        self.rules.extend(other.rules);
    }

    /// Whether a VM called `name` in `namespace` matches any rule
    ///
    /// No trimming or case folding happens here.
    pub fn matches(&self, namespace: &str, name: &str) -> bool {
        self.rules
            .iter()
            .filter(|rule| rule.namespace == namespace)
            .any(|rule| rule.matches(name))
    }

    /// Compiled rules in configuration order
    pub fn rules(&self) -> &[NamespaceRule] {
        &self.rules
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set has no rules
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn push<'a>(
        &mut self,
        namespace: &str,
        raw: impl IntoIterator<Item = &'a str>,
        policy: CompilePolicy,
    ) -> Result<(), RuleError> {
        let patterns = compile_patterns(namespace, raw, policy)?;
        self.push_compiled(namespace, patterns);
        Ok(())
    }

    fn push_compiled(&mut self, namespace: &str, patterns: Vec<Regex>) {
        if !patterns.is_empty() {
            self.rules.push(NamespaceRule {
                namespace: namespace.to_string(),
                patterns,
            });
        }
    }
}

/// Trim, drop empties and compile patterns for one namespace
pub fn compile_patterns<'a>(
    namespace: &str,
    raw: impl IntoIterator<Item = &'a str>,
    policy: CompilePolicy,
) -> Result<Vec<Regex>, RuleError> {
    match policy {
        CompilePolicy::Strict => normalized(raw)
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| RuleError::InvalidPattern {
                    namespace: namespace.to_string(),
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect(),
        CompilePolicy::Lenient => Ok(compile_lenient(namespace, raw)),
    }
}

fn compile_lenient<'a>(namespace: &str, raw: impl IntoIterator<Item = &'a str>) -> Vec<Regex> {
    normalized(raw)
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(
                    namespace = %namespace,
                    pattern = %pattern,
                    error = %e,
                    "Skipping invalid VM name pattern"
                );
                None
            }
        })
        .collect()
}

/// Trim spaces/tabs and drop empty patterns
fn normalized<'a>(raw: impl IntoIterator<Item = &'a str>) -> impl Iterator<Item = &'a str> {
    raw.into_iter()
        .map(|pattern| pattern.trim_matches(|c: char| c == ' ' || c == '\t'))
        .filter(|pattern| !pattern.is_empty())
}
