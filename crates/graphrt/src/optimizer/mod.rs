//! Graph optimization: a pass trait, a pipeline with bounded fixed points, and the
//! standard passes run before execution.

mod context;
pub mod passes;
mod pipeline;

pub use context::{OptimizeConfig, OptimizeContext};
pub use pipeline::{Optimizer, PipelineBuilder, Step};

use crate::error::Result;
use crate::graph::Graph;

/// Statistics returned by a [`GraphPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the graph.
    pub changed: bool,
    /// Number of fixed-point iterations executed.
    pub iterations: usize,
    /// Total number of rewrites applied.
    pub rewrites_applied: usize,
    /// Layers removed by the pass.
    pub erased_layers: usize,
}

impl PassResult {
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_layers: self.erased_layers + other.erased_layers,
        }
    }
}

/// Rewrite or analysis over the whole graph.
pub trait GraphPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut Graph, cx: &mut OptimizeContext) -> Result<PassResult>;
}
