use super::layer_infos;
use crate::backend::{LayerQuery, Support};
use crate::error::{Error, Result};
use crate::graph::{Graph, InputSlotRef, LayerId, LayerKind, OutputSlotRef};
use crate::optimizer::{GraphPass, OptimizeContext, PassResult};

/// Picks a backend for every layer.
///
/// Compute layers take the first candidate whose factory accepts their validated
/// descriptors. Inputs and constants follow their first consumer, outputs follow their
/// producer. Layers that already carry an assignment keep it.
pub struct BackendAssignmentPass;

impl GraphPass for BackendAssignmentPass {
    fn name(&self) -> &'static str {
        "assign"
    }

    fn run(&self, graph: &mut Graph, cx: &mut OptimizeContext) -> Result<PassResult> {
        let order = graph.topological_order()?;
        let mut result = PassResult::unchanged();

        for &id in &order {
            let Some(layer) = graph.layer(id) else {
                continue;
            };
            if layer.backend().is_some() || layer.layer_type().is_boundary() {
                continue;
            }
            let (inputs, outputs) = layer_infos(graph, layer)?;
            let query = LayerQuery {
                name: layer.name(),
                kind: layer.kind(),
                inputs: &inputs,
                outputs: &outputs,
            };

            let mut reasons = Vec::new();
            let mut chosen = None;
            for backend in cx.backends() {
                match backend.factory().is_supported(&query) {
                    Support::Supported => {
                        chosen = Some(backend.id());
                        break;
                    }
                    Support::Unsupported(reason) => {
                        reasons.push(format!("{}: {reason}", backend.id()));
                    }
                }
            }

            let Some(backend) = chosen else {
                if reasons.is_empty() {
                    reasons.push("no backends registered".to_string());
                }
                return Err(Error::BackendUnsupported {
                    layer: layer.name().to_string(),
                    layer_type: layer.layer_type().as_str(),
                    reasons,
                });
            };
            tracing::debug!(layer = layer.name(), backend = %backend, "assigned backend");
            graph.set_backend(id, backend)?;
            result.changed = true;
            result.rewrites_applied += 1;
        }

        // Consumers of boundary layers are assigned by now, except chains of boundary
        // layers, which resolve in reverse topological order.
        for &id in order.iter().rev() {
            if assign_boundary(graph, id, cx)? {
                result.changed = true;
                result.rewrites_applied += 1;
            }
        }
        for &id in &order {
            if assign_boundary(graph, id, cx)? {
                result.changed = true;
                result.rewrites_applied += 1;
            }
        }
        Ok(result)
    }
}

fn assign_boundary(graph: &mut Graph, id: LayerId, cx: &OptimizeContext) -> Result<bool> {
    let Some(layer) = graph.layer(id) else {
        return Ok(false);
    };
    if layer.backend().is_some() || !layer.layer_type().is_boundary() {
        return Ok(false);
    }
    let backend = match layer.kind() {
        LayerKind::Output { .. } => graph
            .producer_of(InputSlotRef::new(id, 0))
            .and_then(|producer| graph.layer(producer.layer))
            .and_then(|producer| producer.backend()),
        _ => graph
            .consumers_of(OutputSlotRef::new(id, 0))
            .iter()
            .filter_map(|consumer| graph.layer(consumer.layer))
            .find_map(|consumer| consumer.backend()),
    };
    // Dangling boundary layers still need storage somewhere.
    let backend = backend.or_else(|| cx.backends().first().map(|backend| backend.id()));
    match backend {
        Some(backend) => {
            graph.set_backend(id, backend)?;
            Ok(true)
        }
        None => Ok(false),
    }
}
