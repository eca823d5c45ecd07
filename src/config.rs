//! Orchestrator configuration.
//!
//! Covers the knobs shared by every sweep: where work directories live, how
//! wide parallel fan-out may go, and how the disk broker meters scratch
//! space. Loadable from TOML with serde defaults for every field.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::env;

/// Configuration for a sweep run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Root directory work directories are created under.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Worker-pool cap for nodes that declare themselves parallel.
    /// Non-parallel nodes always run their variants one at a time.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Total scratch-disk budget in bytes; `None` disables admission limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_budget: Option<u64>,

    /// How often the broker re-checks a request that does not fit yet.
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// How long a node waits for its disk grant before failing initialization.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Scratch-disk demand per node, in bytes, when the node does not
    /// declare its own.
    #[serde(default = "default_disk_demand")]
    pub default_disk_demand: u64,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(env::DEFAULT_WORKSPACE_DIR)
}

fn default_max_parallel() -> usize {
    100
}

fn default_polling_interval_ms() -> u64 {
    50
}

fn default_acquire_timeout_ms() -> u64 {
    300_000
}

fn default_disk_demand() -> u64 {
    1024 * 1024
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            max_parallel: default_max_parallel(),
            disk_budget: None,
            polling_interval_ms: default_polling_interval_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            default_disk_demand: default_disk_demand(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Set the workspace root.
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Set the parallel worker-pool cap (clamped to at least 1).
    pub fn with_max_parallel(mut self, cap: usize) -> Self {
        self.max_parallel = cap.max(1);
        self
    }

    /// Set the total disk budget in bytes.
    pub fn with_disk_budget(mut self, budget: u64) -> Self {
        self.disk_budget = Some(budget);
        self
    }

    /// Set the broker polling interval.
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the disk-grant timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the per-node default disk demand in bytes.
    pub fn with_default_disk_demand(mut self, demand: u64) -> Self {
        self.default_disk_demand = demand;
        self
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}
