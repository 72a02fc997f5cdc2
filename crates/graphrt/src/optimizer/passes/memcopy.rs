use crate::backend::{LayerQuery, Support};
use crate::error::{Error, Result};
use crate::graph::{Graph, InputSlotRef, LayerKind, LayerType};
use crate::optimizer::{GraphPass, OptimizeContext, PassResult};

/// Splices a `MemCopy` layer into every edge whose endpoints live in different memory
/// domains. The copy runs on the consumer's backend.
pub struct MemCopyInsertionPass;

impl GraphPass for MemCopyInsertionPass {
    fn name(&self) -> &'static str {
        "memcopy"
    }

    fn run(&self, graph: &mut Graph, cx: &mut OptimizeContext) -> Result<PassResult> {
        let mut result = PassResult::unchanged();
        for id in graph.topological_order()? {
            let Some(layer) = graph.layer(id) else {
                continue;
            };
            if layer.layer_type() == LayerType::MemCopy {
                continue;
            }
            let Some(consumer_backend) = layer.backend() else {
                continue;
            };
            let consumer_name = layer.name().to_string();

            for index in 0..layer.inputs().len() {
                let input = InputSlotRef::new(id, index);
                let Some(producer) = graph.producer_of(input) else {
                    continue;
                };
                let Some(producer_layer) = graph.layer(producer.layer) else {
                    continue;
                };
                let Some(producer_backend) = producer_layer.backend() else {
                    continue;
                };
                if cx.memory_domain(producer_backend) == cx.memory_domain(consumer_backend) {
                    continue;
                }

                let info = graph.tensor_info(producer).cloned().ok_or_else(|| {
                    Error::graph_invalid(format!(
                        "{}: output {} has no validated descriptor",
                        producer_layer.name(),
                        producer.index
                    ))
                })?;
                let name = format!("{} -> {consumer_name} copy", producer_layer.name());
                let supported = cx.backend(consumer_backend).map(|backend| {
                    backend.factory().is_supported(&LayerQuery {
                        name: &name,
                        kind: &LayerKind::MemCopy,
                        inputs: std::slice::from_ref(&info),
                        outputs: std::slice::from_ref(&info),
                    })
                });
                if let Some(Support::Unsupported(reason)) = supported {
                    return Err(Error::BackendUnsupported {
                        layer: name,
                        layer_type: LayerType::MemCopy.as_str(),
                        reasons: vec![format!("{consumer_backend}: {reason}")],
                    });
                }

                let copy = graph.insert_between(producer, input, name, LayerKind::MemCopy)?;
                graph.set_backend(copy, consumer_backend)?;
                tracing::debug!(
                    from = %producer_backend,
                    to = %consumer_backend,
                    consumer = consumer_name.as_str(),
                    "inserted memory copy"
                );
                result.changed = true;
                result.rewrites_applied += 1;
            }
        }
        Ok(result)
    }
}
