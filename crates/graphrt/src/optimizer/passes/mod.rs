mod assign;
mod fusion;
mod lifetime;
mod memcopy;
mod validate;

pub use assign::BackendAssignmentPass;
pub use fusion::FusionPass;
pub use lifetime::LifetimePass;
pub use memcopy::MemCopyInsertionPass;
pub use validate::ValidationPass;

use crate::error::{Error, Result};
use crate::graph::{Graph, Layer};
use crate::tensor::TensorInfo;

/// Validated descriptors of a layer's inputs (from its producers) and outputs.
pub(crate) fn layer_infos(graph: &Graph, layer: &Layer) -> Result<(Vec<TensorInfo>, Vec<TensorInfo>)> {
    let inputs = layer
        .inputs()
        .iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.connection()
                .and_then(|producer| graph.tensor_info(producer))
                .cloned()
                .ok_or_else(|| {
                    Error::graph_invalid(format!(
                        "{}: input slot {index} has no validated descriptor",
                        layer.name()
                    ))
                })
        })
        .collect::<Result<Vec<_>>>()?;
    let outputs = layer
        .outputs()
        .iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.tensor_info().cloned().ok_or_else(|| {
                Error::graph_invalid(format!(
                    "{}: output slot {index} has no validated descriptor",
                    layer.name()
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((inputs, outputs))
}
