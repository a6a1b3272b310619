//! Typed configuration schema
//!
//! Components receive this record as an immutable context object;
//! dynamic path access in configuration strings maps to plain field
//! access here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Top-level canary configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    pub debug: bool,
    pub session: SessionConfig,
    pub test: TestConfig,
    pub resource_pool: ResourcePoolConfig,
    pub batch: BatchConfig,
    pub env: EnvConfig,
}

/// Session-wide execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Worker pool bound; defaults to the logical cpu count
    pub workers: Option<usize>,
    /// Session timeout in seconds; 0 disables it
    pub timeout: f64,
    pub fail_fast: bool,
    pub max_retries: u32,
    /// Seconds between SIGTERM and SIGKILL on cancellation
    pub grace_period: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workers: None,
            timeout: 0.0,
            fail_fast: false,
            max_retries: 0,
            grace_period: 5.0,
        }
    }
}

/// Per-test defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Default case timeout in seconds
    pub timeout: f64,
    pub timeout_multiplier: f64,
    /// Exit code denoting a numerical difference
    pub diff_exit_code: i32,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            timeout: 300.0,
            timeout_multiplier: 1.0,
            diff_exit_code: 64,
        }
    }
}

/// One addressable pool item in configuration form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolItemConfig {
    pub id: String,
    pub slots: u32,
}

/// Resource pool description: an explicit flat list of typed items,
/// or the uniform shorthand (`nodes` x `<type>_per_node`) expanded by
/// multiplication
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePoolConfig {
    /// Explicit flat form; wins when non-empty
    #[serde(default)]
    pub resources: BTreeMap<String, Vec<PoolItemConfig>>,
    #[serde(default)]
    pub nodes: Option<u32>,
    /// Uniform shorthand counts per node, e.g. `cpus_per_node = 16`
    #[serde(flatten)]
    pub per_node: BTreeMap<String, u32>,
}

impl ResourcePoolConfig {
    /// Expand to the flat typed form.  With nothing configured the
    /// local machine is assumed: one single-slot cpu per logical core.
    pub fn flat(&self) -> BTreeMap<String, Vec<PoolItemConfig>> {
        if !self.resources.is_empty() {
            return self.resources.clone();
        }
        let nodes = self.nodes.unwrap_or(1).max(1);
        let mut per_node: BTreeMap<String, u32> = BTreeMap::new();
        for (key, count) in &self.per_node {
            if let Some(rtype) = key.strip_suffix("_per_node") {
                per_node.insert(rtype.to_string(), *count);
            } else {
                // bare counts ("cpus = 8") describe a single node
                per_node.insert(key.clone(), *count);
            }
        }
        if !per_node.contains_key("cpus") {
            per_node.insert("cpus".to_string(), num_cpus::get() as u32);
        }
        let mut flat = BTreeMap::new();
        for (rtype, count) in per_node {
            if count == 0 {
                continue;
            }
            let total = count * nodes;
            let items = (0..total)
                .map(|i| PoolItemConfig {
                    id: i.to_string(),
                    slots: 1,
                })
                .collect();
            flat.insert(rtype, items);
        }
        flat
    }

    /// Parse the JSON interchange form: either
    /// `{"resource_pool": {"cpus": [{"id": "0", "slots": 1}]}}` or the
    /// uniform shorthand `{"nodes": 2, "cpus_per_node": 16}`.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct Flat {
            resource_pool: BTreeMap<String, Vec<PoolItemConfig>>,
        }
        if let Ok(flat) = serde_json::from_str::<Flat>(text) {
            return Ok(Self {
                resources: flat.resource_pool,
                ..Default::default()
            });
        }
        #[derive(Deserialize)]
        struct Uniform {
            nodes: Option<u32>,
            #[serde(flatten)]
            per_node: BTreeMap<String, u32>,
        }
        let uniform: Uniform =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(Self {
            resources: BTreeMap::new(),
            nodes: uniform.nodes,
            per_node: uniform.per_node,
        })
    }

    /// Serialize to the JSON interchange form (always flat)
    pub fn to_json(&self) -> Result<String, ConfigError> {
        let body = serde_json::json!({ "resource_pool": self.flat() });
        serde_json::to_string_pretty(&body).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Batch execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Partitioning scheme: duration, count, or atomic
    pub scheme: Option<String>,
    /// Target batch runtime in seconds for the duration scheme
    pub duration: f64,
    /// Number of batches for the count scheme
    pub count: Option<usize>,
    /// Workers inside each batch allocation
    pub workers: Option<usize>,
    /// Backend name (subshell, slurm)
    pub scheduler: Option<String>,
    pub scheduler_args: Vec<String>,
    /// Node uniformity: "any" or "same"
    pub nodes: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            scheme: None,
            duration: 1800.0,
            count: None,
            workers: None,
            scheduler: None,
            scheduler_args: Vec::new(),
            nodes: "any".to_string(),
        }
    }
}

/// Environment exports applied to every case
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub set: BTreeMap<String, String>,
    pub unset: Vec<String>,
    pub prepend_path: BTreeMap<String, String>,
    pub append_path: BTreeMap<String, String>,
}

/// Validate cross-field constraints, naming the offending key
pub fn validate_config(config: &CanaryConfig) -> Result<(), ConfigError> {
    if let Some(workers) = config.session.workers {
        if workers == 0 {
            return Err(ConfigError::Invalid {
                key: "session.workers".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
    }
    if config.session.timeout < 0.0 {
        return Err(ConfigError::Invalid {
            key: "session.timeout".to_string(),
            reason: "must be non-negative".to_string(),
        });
    }
    if config.test.timeout <= 0.0 {
        return Err(ConfigError::Invalid {
            key: "test.timeout".to_string(),
            reason: "must be positive".to_string(),
        });
    }
    if config.test.timeout_multiplier <= 0.0 {
        return Err(ConfigError::Invalid {
            key: "test.timeout_multiplier".to_string(),
            reason: "must be positive".to_string(),
        });
    }
    if let Some(scheme) = &config.batch.scheme {
        if !matches!(scheme.as_str(), "duration" | "count" | "atomic") {
            return Err(ConfigError::Invalid {
                key: "batch.scheme".to_string(),
                reason: format!("{:?} not in (duration, count, atomic)", scheme),
            });
        }
    }
    if config.batch.duration <= 0.0 {
        return Err(ConfigError::Invalid {
            key: "batch.duration".to_string(),
            reason: "must be positive".to_string(),
        });
    }
    if !matches!(config.batch.nodes.as_str(), "any" | "same") {
        return Err(ConfigError::Invalid {
            key: "batch.nodes".to_string(),
            reason: format!("{:?} not in (any, same)", config.batch.nodes),
        });
    }
    Ok(())
}
