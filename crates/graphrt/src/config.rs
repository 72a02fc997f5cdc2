//! Engine configuration, loadable from JSON and overridable from the environment.

use serde::{Deserialize, Serialize};

use crate::env::{self, PROFILE_VAR, THREADS_VAR};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Backend ids to use, in order. Empty means every registered backend by priority.
    pub backend_preferences: Vec<String>,
    pub enable_fusion: bool,
    /// Record workload and kernel timings into the engine's profiler.
    pub profiling: bool,
    /// Worker threads for backend schedulers; `None` keeps each backend's default.
    pub thread_count: Option<usize>,
    /// Cap on pooled bytes per backend, on top of the allocator's own capacity.
    pub memory_limit_bytes: Option<usize>,
    /// Iteration bound for fixed-point optimizer steps.
    pub fixed_point_max_iters: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend_preferences: Vec::new(),
            enable_fusion: true,
            profiling: false,
            thread_count: None,
            memory_limit_bytes: None,
            fixed_point_max_iters: 4,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|err| Error::Config(format!("malformed engine config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| Error::Config(format!("cannot serialize engine config: {err}")))
    }

    /// Applies `GRAPHRT_PROFILE` and `GRAPHRT_THREADS` when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(profiling) = env::env_bool(PROFILE_VAR) {
            self.profiling = profiling;
        }
        if let Some(threads) = env::env_usize(THREADS_VAR) {
            self.thread_count = Some(threads);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_count == Some(0) {
            return Err(Error::Config("thread_count must be positive".to_string()));
        }
        if self.fixed_point_max_iters == 0 {
            return Err(Error::Config(
                "fixed_point_max_iters must be positive".to_string(),
            ));
        }
        if let Some(duplicate) = self
            .backend_preferences
            .iter()
            .enumerate()
            .find(|(i, name)| self.backend_preferences[..*i].contains(name))
            .map(|(_, name)| name)
        {
            return Err(Error::Config(format!(
                "backend {duplicate} is listed twice in backend_preferences"
            )));
        }
        Ok(())
    }
}
