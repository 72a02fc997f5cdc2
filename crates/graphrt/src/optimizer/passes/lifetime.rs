use crate::error::Result;
use crate::graph::Graph;
use crate::memory::compute_live_ranges;
use crate::optimizer::{GraphPass, OptimizeContext, PassResult};

/// Fixes the dispatch order and records each output slot's live range.
pub struct LifetimePass;

impl GraphPass for LifetimePass {
    fn name(&self) -> &'static str {
        "lifetime"
    }

    fn run(&self, graph: &mut Graph, cx: &mut OptimizeContext) -> Result<PassResult> {
        let order = graph.topological_order()?;
        let lifetimes = compute_live_ranges(graph, &order)?;
        cx.order = Some(order);
        cx.lifetimes = Some(lifetimes);
        Ok(PassResult::unchanged())
    }
}
