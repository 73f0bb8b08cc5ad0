// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Cluster Configuration Types
//
// Defines the configuration schema for a lock manager node:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Node identity and default namespace side
// - Per-namespace pool, LRU and capacity tunables
// - Request worker sizing
// - Logging and metrics settings

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::domain::pool::{NamespaceSide, DEFAULT_GRANT_STEP, DEFAULT_LIMIT, DEFAULT_VOLUME_FACTOR};

pub const API_VERSION: &str = "cohort.dev/v1";
pub const KIND: &str = "DlmConfig";

/// Top-level Kubernetes-style cluster configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfigManifest {
    /// API version (must be "cohort.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "DlmConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: ClusterConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfigSpec {
    pub node: NodeIdentity,

    /// Namespaces created at startup
    #[serde(default)]
    pub namespaces: Vec<NamespaceConfig>,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: String,

    /// Side used for namespaces that do not name one
    #[serde(default = "default_side")]
    pub default_side: NamespaceSide,
}

/// One lock namespace and its tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<NamespaceSide>,

    /// Pool limit (locks the namespace is planned to sustain)
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Grant plan step, percent of the gap to the limit
    #[serde(default = "default_grant_step")]
    pub grant_step: u32,

    /// Cache-side sensitivity to lock age
    #[serde(default = "default_volume_factor")]
    pub volume_factor: u64,

    /// Pool controller tick
    #[serde(default = "default_recalc_interval_ms")]
    pub recalc_interval_ms: u64,

    /// Cache-side ceiling on idle cached locks
    #[serde(default = "default_unused_max")]
    pub unused_max: usize,

    /// Idle locks older than this are cancelled regardless of volume
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// Upper bound on live lock records (unbounded when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_capacity: Option<usize>,
}

impl NamespaceConfig {
    pub fn new(name: impl Into<String>, side: NamespaceSide) -> Self {
        Self {
            name: name.into(),
            side: Some(side),
            limit: default_limit(),
            grant_step: default_grant_step(),
            volume_factor: default_volume_factor(),
            recalc_interval_ms: default_recalc_interval_ms(),
            unused_max: default_unused_max(),
            max_age_secs: default_max_age_secs(),
            lock_capacity: None,
        }
    }

    pub fn side_or(&self, fallback: NamespaceSide) -> NamespaceSide {
        self.side.unwrap_or(fallback)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent request workers
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Bounded inbound queue depth
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            queue_depth: default_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_side() -> NamespaceSide {
    NamespaceSide::Server
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_grant_step() -> u32 {
    DEFAULT_GRANT_STEP
}

fn default_volume_factor() -> u64 {
    DEFAULT_VOLUME_FACTOR
}

fn default_recalc_interval_ms() -> u64 {
    1000
}

fn default_unused_max() -> usize {
    100
}

fn default_max_age_secs() -> u64 {
    3900
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_depth() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for ClusterConfigSpec {
    fn default() -> Self {
        Self {
            node: NodeIdentity {
                id: uuid::Uuid::new_v4().to_string(),
                default_side: default_side(),
            },
            namespaces: vec![NamespaceConfig::new("default", default_side())],
            workers: WorkerConfig::default(),
            observability: None,
        }
    }
}

impl Default for ClusterConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "cohort-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: ClusterConfigSpec::default(),
        }
    }
}

impl ClusterConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. COHORT_CONFIG_PATH environment variable
    /// 2. ./cohort-config.yaml (working directory)
    /// 3. ~/.cohort/config.yaml (user home)
    /// 4. /etc/cohort/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("COHORT_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./cohort-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".cohort").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/cohort/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit path: fail if missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("COHORT_POOL_LIMIT") {
            match val.parse::<u64>() {
                Ok(limit) if limit > 0 => {
                    tracing::info!("Environment override: COHORT_POOL_LIMIT={}", limit);
                    for ns in &mut self.spec.namespaces {
                        ns.limit = limit;
                    }
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for COHORT_POOL_LIMIT: '{}'. Expected a positive integer. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Some(val) = lookup("COHORT_WORKERS") {
            match val.parse::<usize>() {
                Ok(count) if count > 0 => {
                    tracing::info!("Environment override: COHORT_WORKERS={}", count);
                    self.spec.workers.count = count;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for COHORT_WORKERS: '{}'. Expected a positive integer. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.node.id.is_empty() {
            anyhow::bail!("spec.node.id cannot be empty");
        }

        let mut seen = HashSet::new();
        for ns in &self.spec.namespaces {
            if ns.name.is_empty() {
                anyhow::bail!("Namespace name cannot be empty");
            }
            if !seen.insert(ns.name.as_str()) {
                anyhow::bail!("Duplicate namespace: {}", ns.name);
            }
            if ns.limit == 0 {
                anyhow::bail!("Namespace {}: limit must be greater than zero", ns.name);
            }
            if ns.grant_step > 100 {
                anyhow::bail!(
                    "Namespace {}: grant_step is a percentage, got {}",
                    ns.name,
                    ns.grant_step
                );
            }
            if ns.volume_factor == 0 {
                anyhow::bail!("Namespace {}: volume_factor must be at least 1", ns.name);
            }
            if ns.recalc_interval_ms == 0 {
                anyhow::bail!("Namespace {}: recalc_interval_ms must be positive", ns.name);
            }
            if ns.lock_capacity == Some(0) {
                anyhow::bail!("Namespace {}: lock_capacity cannot be zero", ns.name);
            }
        }

        if self.spec.workers.count == 0 {
            anyhow::bail!("spec.workers.count must be at least 1");
        }
        if self.spec.workers.queue_depth == 0 {
            anyhow::bail!("spec.workers.queue_depth must be at least 1");
        }

        Ok(())
    }

    /// Namespaces with their side resolved against the node default.
    pub fn resolved_namespaces(&self) -> Vec<(NamespaceConfig, NamespaceSide)> {
        self.spec
            .namespaces
            .iter()
            .map(|ns| (ns.clone(), ns.side_or(self.spec.node.default_side)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
apiVersion: cohort.dev/v1
kind: DlmConfig
metadata:
  name: mds-0
spec:
  node:
    id: mds-0
    default_side: server
  namespaces:
    - name: mdt0000
      limit: 4096
      grant_step: 10
    - name: osc-cache
      side: client
      unused_max: 32
      lock_capacity: 100000
  workers:
    count: 8
"#;

    #[test]
    fn test_default_manifest() {
        let manifest = ClusterConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert!(!manifest.metadata.name.is_empty());
        assert_eq!(manifest.spec.namespaces.len(), 1);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_parse_applies_field_defaults() {
        let manifest = ClusterConfigManifest::from_yaml_str(SAMPLE).unwrap();
        manifest.validate().unwrap();

        let ns = manifest.resolved_namespaces();
        assert_eq!(ns[0].1, NamespaceSide::Server);
        assert_eq!(ns[0].0.limit, 4096);
        assert_eq!(ns[0].0.grant_step, 10);
        assert_eq!(ns[0].0.volume_factor, 1);
        assert_eq!(ns[1].1, NamespaceSide::Client);
        assert_eq!(ns[1].0.unused_max, 32);
        assert_eq!(ns[1].0.lock_capacity, Some(100_000));
        assert_eq!(manifest.spec.workers.count, 8);
        assert_eq!(manifest.spec.workers.queue_depth, 1024);
    }

    #[test]
    fn test_validation() {
        let mut manifest = ClusterConfigManifest::from_yaml_str(SAMPLE).unwrap();
        assert!(manifest.validate().is_ok());

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.namespaces[0].grant_step = 101;
        assert!(manifest.validate().is_err());
        manifest.spec.namespaces[0].grant_step = 5;

        manifest.spec.namespaces[0].limit = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.namespaces[0].limit = 1;

        manifest.spec.namespaces[1].name = "mdt0000".to_string();
        assert!(manifest.validate().is_err());
        manifest.spec.namespaces[1].name = "osc-cache".to_string();

        manifest.spec.workers.count = 0;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut manifest = ClusterConfigManifest::from_yaml_str(SAMPLE).unwrap();
        let env = HashMap::from([
            ("COHORT_POOL_LIMIT", "77".to_string()),
            ("COHORT_WORKERS", "zero".to_string()),
        ]);
        manifest.apply_overrides_from(|k| env.get(k).cloned());
        assert!(manifest.spec.namespaces.iter().all(|ns| ns.limit == 77));
        assert_eq!(manifest.spec.workers.count, 8);
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cohort-config.yaml");
        let manifest = ClusterConfigManifest::from_yaml_str(SAMPLE).unwrap();
        manifest.to_yaml_file(&path).unwrap();

        let loaded = ClusterConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.spec.namespaces, manifest.spec.namespaces);
        assert!(ClusterConfigManifest::load_or_default(Some(dir.path().join("missing.yaml"))).is_err());
    }
}
