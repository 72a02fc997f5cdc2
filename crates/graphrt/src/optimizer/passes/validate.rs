use crate::error::Result;
use crate::graph::Graph;
use crate::optimizer::{GraphPass, OptimizeContext, PassResult};

/// Shape and type inference over every layer in topological order.
///
/// Stops at the first failing layer. Descriptors it fills in count as changes only the
/// first time, so a validated graph passes through unchanged.
pub struct ValidationPass;

impl GraphPass for ValidationPass {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn run(&self, graph: &mut Graph, _cx: &mut OptimizeContext) -> Result<PassResult> {
        graph.verify()?;
        let mut result = PassResult::unchanged();
        for id in graph.topological_order()? {
            let before = graph.layer(id).map(|layer| layer.outputs().to_vec());
            graph.validate_layer(id)?;
            let after = graph.layer(id).map(|layer| layer.outputs().to_vec());
            if before != after {
                result.changed = true;
                result.rewrites_applied += 1;
            }
        }
        Ok(result)
    }
}
