use std::sync::Arc;

use crate::backend::{Backend, BackendId, MemoryDomain};
use crate::config::EngineConfig;
use crate::graph::LayerId;
use crate::memory::LifetimePlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizeConfig {
    pub enable_fusion: bool,
    pub fixed_point_max_iters: usize,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            enable_fusion: true,
            fixed_point_max_iters: 4,
        }
    }
}

impl From<&EngineConfig> for OptimizeConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            enable_fusion: config.enable_fusion,
            fixed_point_max_iters: config.fixed_point_max_iters.max(1),
        }
    }
}

/// State shared by passes: candidate backends in selection order and analysis results.
pub struct OptimizeContext {
    backends: Vec<Arc<dyn Backend>>,
    pub config: OptimizeConfig,
    /// Dispatch order computed by the lifetime pass.
    pub order: Option<Vec<LayerId>>,
    pub lifetimes: Option<LifetimePlan>,
}

impl OptimizeContext {
    pub fn new(backends: Vec<Arc<dyn Backend>>, config: OptimizeConfig) -> Self {
        Self {
            backends,
            config,
            order: None,
            lifetimes: None,
        }
    }

    /// Candidates in the order assignment tries them.
    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    pub fn backend(&self, id: BackendId) -> Option<&Arc<dyn Backend>> {
        self.backends.iter().find(|backend| backend.id() == id)
    }

    pub fn memory_domain(&self, id: BackendId) -> Option<MemoryDomain> {
        self.backend(id)
            .map(|backend| backend.capabilities().memory_domain)
    }
}
