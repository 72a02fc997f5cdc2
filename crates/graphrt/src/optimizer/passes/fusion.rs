use super::layer_infos;
use crate::backend::LayerQuery;
use crate::error::Result;
use crate::graph::{ActivationFunction, Graph, InputSlotRef, LayerId, LayerKind, OutputSlotRef};
use crate::optimizer::{GraphPass, OptimizeContext, PassResult};
use crate::tensor::{ConstTensor, DataType, TensorInfo};

/// Folds bias additions and activations into the preceding convolution or fully-connected
/// layer.
///
/// Patterns, most specialized first:
/// `Convolution2d + Addition(bias constant) + Activation`, `Convolution2d + Addition(bias
/// constant)`, `Convolution2d + Activation`, `FullyConnected + Activation`.
/// A match is only rewritten when some candidate backend supports the fused layer and
/// every intermediate tensor has exactly one consumer. Only `Float32` chains are fused.
pub struct FusionPass;

struct Candidate {
    kind: LayerKind,
    /// Layers absorbed into the head, in chain order.
    absorbed: Vec<LayerId>,
    /// Bias constant that may become dead after the rewrite.
    bias_source: Option<LayerId>,
    /// Descriptor of the chain's final output.
    output: TensorInfo,
}

impl GraphPass for FusionPass {
    fn name(&self) -> &'static str {
        "fusion"
    }

    fn run(&self, graph: &mut Graph, cx: &mut OptimizeContext) -> Result<PassResult> {
        let mut result = PassResult::unchanged();
        for head in graph.topological_order()? {
            let candidates = match graph.layer(head).map(|layer| layer.kind()) {
                Some(LayerKind::Convolution2d { .. }) | Some(LayerKind::FullyConnected { .. }) => {
                    candidates_for(graph, head)
                }
                _ => continue,
            };
            for candidate in candidates {
                if !any_backend_supports(graph, head, &candidate, cx)? {
                    continue;
                }
                apply(graph, head, candidate, &mut result)?;
                break;
            }
        }
        Ok(result)
    }
}

fn single_consumer(graph: &Graph, slot: OutputSlotRef) -> Option<InputSlotRef> {
    match graph.consumers_of(slot) {
        [only] => Some(*only),
        _ => None,
    }
}

fn is_float32(info: Option<&TensorInfo>) -> bool {
    info.is_some_and(|info| info.data_type == DataType::Float32)
}

/// Fusion candidates rooted at `head`, most specialized first.
fn candidates_for(graph: &Graph, head: LayerId) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let Some(layer) = graph.layer(head) else {
        return candidates;
    };
    if layer.kind().fused_activation().is_some() || !is_float32(layer.output_info(0)) {
        return candidates;
    }
    let Some(next) = single_consumer(graph, layer.output_ref(0)) else {
        return candidates;
    };
    let Some(next_layer) = graph.layer(next.layer) else {
        return candidates;
    };

    match (layer.kind(), next_layer.kind()) {
        (
            LayerKind::Convolution2d {
                descriptor,
                weights,
                bias: None,
            },
            LayerKind::Addition,
        ) => {
            let Some((bias, bias_source)) = bias_operand(graph, next.layer, next.index) else {
                return candidates;
            };
            if bias.info().num_elements() != Some(weights.info().shape[0] as usize)
                || next_layer.output_info(0) != layer.output_info(0)
            {
                return candidates;
            }
            let Some(add_output) = next_layer.output_info(0).cloned() else {
                return candidates;
            };
            let mut fused = *descriptor;
            fused.bias_enabled = true;

            if let Some(act) = single_consumer(graph, next_layer.output_ref(0))
                .and_then(|slot| graph.layer(slot.layer))
            {
                if let (LayerKind::Activation { function }, Some(act_output)) =
                    (act.kind(), act.output_info(0))
                {
                    if is_float32(Some(act_output)) {
                        let mut with_act = fused;
                        with_act.fused_activation = Some(*function);
                        candidates.push(Candidate {
                            kind: LayerKind::Convolution2d {
                                descriptor: with_act,
                                weights: weights.clone(),
                                bias: Some(bias.clone()),
                            },
                            absorbed: vec![next.layer, act.id()],
                            bias_source: Some(bias_source),
                            output: act_output.clone(),
                        });
                    }
                }
            }

            candidates.push(Candidate {
                kind: LayerKind::Convolution2d {
                    descriptor: fused,
                    weights: weights.clone(),
                    bias: Some(bias),
                },
                absorbed: vec![next.layer],
                bias_source: Some(bias_source),
                output: add_output,
            });
        }
        (
            LayerKind::Convolution2d {
                descriptor,
                weights,
                bias,
            },
            LayerKind::Activation { function },
        ) => {
            if let Some(output) = next_layer.output_info(0).filter(|info| is_float32(Some(info))) {
                let mut fused = *descriptor;
                fused.fused_activation = Some(*function);
                candidates.push(Candidate {
                    kind: LayerKind::Convolution2d {
                        descriptor: fused,
                        weights: weights.clone(),
                        bias: bias.clone(),
                    },
                    absorbed: vec![next.layer],
                    bias_source: None,
                    output: output.clone(),
                });
            }
        }
        (
            LayerKind::FullyConnected {
                descriptor,
                weights,
                bias,
            },
            LayerKind::Activation { function },
        ) => {
            if let Some(output) = next_layer.output_info(0).filter(|info| is_float32(Some(info))) {
                let mut fused = *descriptor;
                fused.fused_activation = Some(*function);
                candidates.push(Candidate {
                    kind: LayerKind::FullyConnected {
                        descriptor: fused,
                        weights: weights.clone(),
                        bias: bias.clone(),
                    },
                    absorbed: vec![next.layer],
                    bias_source: None,
                    output: output.clone(),
                });
            }
        }
        _ => {}
    }
    candidates
}

/// The constant feeding the other operand of an addition, when it is a per-channel
/// `Float32` vector shaped `[1, .., 1, C]`.
fn bias_operand(graph: &Graph, add: LayerId, head_slot: usize) -> Option<(ConstTensor, LayerId)> {
    let other = InputSlotRef::new(add, 1 - head_slot);
    let producer = graph.producer_of(other)?;
    let source = graph.layer(producer.layer)?;
    let LayerKind::Constant { tensor } = source.kind() else {
        return None;
    };
    let info = tensor.info();
    let dims = info.shape.dims();
    let per_channel = dims[..dims.len() - 1].iter().all(|&d| d == 1);
    if info.data_type != DataType::Float32 || !per_channel {
        return None;
    }
    Some((tensor.clone(), source.id()))
}

fn any_backend_supports(
    graph: &Graph,
    head: LayerId,
    candidate: &Candidate,
    cx: &OptimizeContext,
) -> Result<bool> {
    let Some(layer) = graph.layer(head) else {
        return Ok(false);
    };
    let (inputs, _) = layer_infos(graph, layer)?;
    let outputs = [candidate.output.clone()];
    let query = LayerQuery {
        name: layer.name(),
        kind: &candidate.kind,
        inputs: &inputs,
        outputs: &outputs,
    };
    Ok(cx
        .backends()
        .iter()
        .any(|backend| backend.factory().is_supported(&query).is_supported()))
}

fn apply(graph: &mut Graph, head: LayerId, candidate: Candidate, result: &mut PassResult) -> Result<()> {
    let Candidate {
        kind,
        absorbed,
        bias_source,
        output,
    } = candidate;
    let tail = *absorbed.last().unwrap_or(&head);
    let head_out = OutputSlotRef::new(head, 0);

    graph.reroute_consumers(OutputSlotRef::new(tail, 0), head_out)?;
    for id in &absorbed {
        graph.erase_layer(*id)?;
    }
    result.erased_layers += absorbed.len();

    if let Some(source) = bias_source {
        if graph.consumers_of(OutputSlotRef::new(source, 0)).is_empty() {
            graph.erase_layer(source)?;
            result.erased_layers += 1;
        }
    }

    let activation: Option<ActivationFunction> = kind.fused_activation();
    let layer = graph.layer_entry_mut(head);
    layer.kind = kind;
    layer.outputs[0].info = Some(output);
    tracing::debug!(
        layer = layer.name.as_str(),
        absorbed = absorbed.len(),
        activation = ?activation,
        "fused layers"
    );
    result.changed = true;
    result.rewrites_applied += 1;
    Ok(())
}
