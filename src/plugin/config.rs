//! Plugin configuration types and parsing
//!
//! This module defines configuration structures for the routing plugin chain.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Routing plugin chain configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    /// Plugins consulted per query
    #[serde(default)]
    pub plugins: Vec<PluginAssignment>,

    /// What happens to a rewritten query
    #[serde(default)]
    pub rewrite_policy: RewritePolicy,

    /// Upper bound on chain restarts under [`RewritePolicy::Rerun`]
    #[serde(default = "default_max_rewrite_passes")]
    pub max_rewrite_passes: u32,

    /// What happens when a plugin faults
    #[serde(default)]
    pub fault_policy: FaultPolicy,

    /// Maximum concurrent plugin invocations (global semaphore limit)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: u32,

    /// Number of warm processes to keep per process plugin
    #[serde(default = "default_pool_size")]
    pub pool_size_per_plugin: u32,

    /// Default timeout for one routing call (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

/// Handling of REWRITE decisions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RewritePolicy {
    /// The rewritten query goes straight to execution
    #[default]
    SinglePass,
    /// The rewritten query is routed again from the first plugin
    Rerun,
}

/// Handling of plugin faults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Log the fault and treat the plugin as undecided
    #[default]
    Degrade,
    /// Abort routing of the query
    Fatal,
}

/// Individual plugin assignment
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginAssignment {
    /// Plugin name, unique within the chain
    pub name: String,

    /// Execution order (lower numbers execute first)
    #[serde(default)]
    pub order: u32,

    /// Whether this plugin is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Override default timeout for this plugin (milliseconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Executable for process plugins. Without it the host must register an
    /// in-process plugin under the same name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<PathBuf>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl PluginAssignment {
    /// In-process plugin assignment with default settings.
    pub fn named(name: impl Into<String>, order: u32) -> Self {
        Self {
            name: name.into(),
            order,
            enabled: true,
            timeout_ms: None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

// Default value functions
fn default_max_rewrite_passes() -> u32 {
    8
}

fn default_max_concurrent() -> u32 {
    10
}

fn default_pool_size() -> u32 {
    5
}

fn default_timeout_ms() -> u64 {
    1000
}

pub(crate) fn default_enabled() -> bool {
    true
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
            rewrite_policy: RewritePolicy::default(),
            max_rewrite_passes: default_max_rewrite_passes(),
            fault_policy: FaultPolicy::default(),
            max_concurrent_executions: default_max_concurrent(),
            pool_size_per_plugin: default_pool_size(),
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

impl PluginConfig {
    /// Validate plugin configuration
    pub fn validate(&self) -> Result<(), String> {
        // Validate concurrency limits
        if self.max_concurrent_executions == 0 {
            return Err("max_concurrent_executions must be greater than 0".to_string());
        }

        if self.max_concurrent_executions > 100 {
            return Err("max_concurrent_executions cannot exceed 100".to_string());
        }

        if self.pool_size_per_plugin > self.max_concurrent_executions {
            return Err(format!(
                "pool_size_per_plugin ({}) cannot exceed max_concurrent_executions ({})",
                self.pool_size_per_plugin, self.max_concurrent_executions
            ));
        }

        if self.max_rewrite_passes == 0 {
            return Err("max_rewrite_passes must be greater than 0".to_string());
        }

        validate_timeout("default_timeout_ms", self.default_timeout_ms)?;

        // Check for duplicate plugin names
        let mut seen_names = HashSet::new();
        for plugin in &self.plugins {
            if plugin.name.is_empty() {
                return Err("Plugin name cannot be empty".to_string());
            }

            if !seen_names.insert(&plugin.name) {
                return Err(format!("Duplicate plugin '{}' in chain", plugin.name));
            }

            if let Some(timeout_ms) = plugin.timeout_ms {
                validate_timeout(&format!("Plugin '{}' timeout_ms", plugin.name), timeout_ms)?;
            }

            if let Some(command) = &plugin.command {
                if command.as_os_str().is_empty() {
                    return Err(format!("Plugin '{}' has empty command", plugin.name));
                }
            }
        }

        Ok(())
    }

    /// Enabled plugins in chain order. Equal `order` values keep their
    /// declaration order.
    pub fn chain(&self) -> Vec<PluginAssignment> {
        let mut plugins: Vec<PluginAssignment> =
            self.plugins.iter().filter(|p| p.enabled).cloned().collect();
        plugins.sort_by_key(|p| p.order);
        plugins
    }

    /// Get the effective timeout for a plugin
    pub fn get_plugin_timeout(&self, assignment: &PluginAssignment) -> u64 {
        assignment.timeout_ms.unwrap_or(self.default_timeout_ms)
    }
}

fn validate_timeout(label: &str, timeout_ms: u64) -> Result<(), String> {
    if timeout_ms < 100 {
        return Err(format!("{label} must be at least 100ms"));
    }
    if timeout_ms > 600_000 {
        return Err(format!("{label} cannot exceed 600000ms (10 minutes)"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PluginConfig::default();
        assert_eq!(config.max_concurrent_executions, 10);
        assert_eq!(config.pool_size_per_plugin, 5);
        assert_eq!(config.default_timeout_ms, 1000);
        assert_eq!(config.rewrite_policy, RewritePolicy::SinglePass);
        assert_eq!(config.fault_policy, FaultPolicy::Degrade);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_concurrency_limits() {
        let mut config = PluginConfig::default();

        config.max_concurrent_executions = 0;
        assert!(config.validate().is_err());

        // Pool size > max concurrent should fail
        config.max_concurrent_executions = 5;
        config.pool_size_per_plugin = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_plugins_rejected() {
        let config = PluginConfig {
            plugins: vec![
                PluginAssignment::named("sharding", 1),
                PluginAssignment::named("sharding", 2),
            ],
            ..Default::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.contains("Duplicate plugin 'sharding'"));
    }

    #[test]
    fn test_chain_ordering() {
        let config = PluginConfig {
            plugins: vec![
                PluginAssignment::named("plugin3", 3),
                PluginAssignment::named("plugin1", 1),
                PluginAssignment::named("plugin2a", 2),
                PluginAssignment::named("plugin2b", 2),
            ],
            ..Default::default()
        };

        let names: Vec<String> = config.chain().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["plugin1", "plugin2a", "plugin2b", "plugin3"]);
    }

    #[test]
    fn test_enabled_filtering() {
        let mut disabled = PluginAssignment::named("disabled", 2);
        disabled.enabled = false;

        let config = PluginConfig {
            plugins: vec![PluginAssignment::named("enabled", 1), disabled],
            ..Default::default()
        };

        let plugins = config.chain();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].name, "enabled");
    }

    #[test]
    fn test_timeout_override() {
        let config = PluginConfig::default();

        let mut assignment = PluginAssignment::named("test", 1);
        assignment.timeout_ms = Some(450);
        assert_eq!(config.get_plugin_timeout(&assignment), 450);

        let assignment_no_override = PluginAssignment::named("test", 1);
        assert_eq!(config.get_plugin_timeout(&assignment_no_override), 1000);
    }

    #[test]
    fn test_policies_deserialize() {
        let config: PluginConfig = serde_json::from_str(
            r#"{"rewritePolicy": "rerun", "faultPolicy": "fatal", "plugins": [{"name": "a"}]}"#,
        )
        .unwrap();
        assert_eq!(config.rewrite_policy, RewritePolicy::Rerun);
        assert_eq!(config.fault_policy, FaultPolicy::Fatal);
        assert!(config.plugins[0].enabled);
        assert_eq!(config.max_rewrite_passes, 8);
    }
}
