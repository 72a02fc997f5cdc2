use std::sync::Arc;

use super::passes::{
    BackendAssignmentPass, FusionPass, LifetimePass, MemCopyInsertionPass, ValidationPass,
};
use super::{GraphPass, OptimizeConfig, OptimizeContext, PassResult};
use crate::error::Result;
use crate::graph::Graph;

pub enum Step {
    Pass(Arc<dyn GraphPass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

#[derive(Default)]
pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn pass(&mut self, pass: Arc<dyn GraphPass>) {
        self.steps.push(Step::Pass(pass));
    }

    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> Vec<Step> {
        self.steps
    }
}

/// Runs a fixed list of steps over a graph. Running it again on its own output is a no-op.
pub struct Optimizer {
    steps: Vec<Step>,
    log_stats: bool,
}

impl Optimizer {
    /// Validation, fusion to a fixed point, revalidation, assignment, copy insertion and
    /// lifetime planning.
    pub fn new(config: OptimizeConfig) -> Self {
        let mut builder = PipelineBuilder::new();
        builder.pass(Arc::new(ValidationPass));
        if config.enable_fusion {
            builder.fixed_point(config.fixed_point_max_iters, |p| {
                p.pass(Arc::new(FusionPass));
            });
            builder.pass(Arc::new(ValidationPass));
        }
        builder.pass(Arc::new(BackendAssignmentPass));
        builder.pass(Arc::new(MemCopyInsertionPass));
        builder.pass(Arc::new(LifetimePass));
        Self::from_steps(builder.finish())
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self {
            steps,
            log_stats: crate::env::pass_stats_enabled(),
        }
    }

    pub fn optimize(&self, graph: &mut Graph, cx: &mut OptimizeContext) -> Result<PassResult> {
        let mut result = PassResult::default();
        run_steps(&self.steps, graph, cx, &mut result, self.log_stats)?;
        Ok(result)
    }
}

fn run_steps(
    steps: &[Step],
    graph: &mut Graph,
    cx: &mut OptimizeContext,
    totals: &mut PassResult,
    log_stats: bool,
) -> Result<bool> {
    let mut changed_any = false;
    for step in steps {
        match step {
            Step::Pass(pass) => {
                let stats = pass.run(graph, cx)?;
                changed_any |= stats.changed;
                *totals = totals.merge(stats);
                emit_pass_stats(pass.name(), graph, stats, log_stats);
            }
            Step::FixedPoint { max_iters, steps } => {
                let mut iter = 0usize;
                loop {
                    if iter >= *max_iters {
                        break;
                    }
                    iter += 1;
                    let mut local = PassResult::default();
                    let changed = run_steps(steps, graph, cx, &mut local, log_stats)?;
                    local.iterations += 1;
                    *totals = totals.merge(local);
                    changed_any |= changed;
                    if !changed {
                        break;
                    }
                }
            }
        }
    }
    Ok(changed_any)
}

fn emit_pass_stats(name: &str, graph: &Graph, stats: PassResult, log_stats: bool) {
    if log_stats {
        tracing::info!(
            pass = name,
            changed = stats.changed,
            rewrites = stats.rewrites_applied,
            erased = stats.erased_layers,
            layers = graph.len(),
            "optimizer pass"
        );
    } else {
        tracing::debug!(
            pass = name,
            changed = stats.changed,
            rewrites = stats.rewrites_applied,
            erased = stats.erased_layers,
            layers = graph.len(),
            "optimizer pass"
        );
    }
}
