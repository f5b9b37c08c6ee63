//! Runtime configuration.
//!
//! Every field has a default, so an empty document is a valid config:
//!
//! ```toml
//! [scheduler]
//! max_jobs_per_run = 100000
//!
//! [serde]
//! max_depth = 64
//!
//! [worker]
//! trusted_origin = "app://main"
//! token_prefix = "call"
//! ```

use serde::Deserialize;

use crate::error::{RuntimeError, RuntimeResult};

/// Nesting limit of the stringify/parse visitors.
pub const DEFAULT_MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    pub serde: SerdeConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Upper bound on jobs executed by one `run_until_idle`. `None` = unbounded.
    pub max_jobs_per_run: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerdeConfig {
    pub max_depth: usize,
}

impl Default for SerdeConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// When set, inbound messages from any other origin are dropped.
    pub trusted_origin: Option<String>,
    /// Prefix of generated correlation tokens.
    pub token_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            trusted_origin: None,
            token_prefix: "call".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(text: &str) -> RuntimeResult<Self> {
        let config: RuntimeConfig =
            toml::from_str(text).map_err(|e| RuntimeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> RuntimeResult<()> {
        if self.serde.max_depth == 0 {
            return Err(RuntimeError::Config("serde.max_depth must be positive".into()));
        }
        if self.scheduler.max_jobs_per_run == Some(0) {
            return Err(RuntimeError::Config(
                "scheduler.max_jobs_per_run must be positive".into(),
            ));
        }
        if self.worker.token_prefix.is_empty() {
            return Err(RuntimeError::Config("worker.token_prefix must not be empty".into()));
        }
        Ok(())
    }
}
