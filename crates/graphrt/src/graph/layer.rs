use std::fmt;

use serde::{Deserialize, Serialize};

use super::table;
use super::Graph;
use crate::backend::BackendId;
use crate::error::{Error, Result};
use crate::tensor::{ConstTensor, TensorInfo, TensorShape};

/// Arena key of a layer. Ids are never reused within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub(crate) u32);

impl LayerId {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputSlotRef {
    pub layer: LayerId,
    pub index: usize,
}

impl OutputSlotRef {
    pub fn new(layer: LayerId, index: usize) -> Self {
        Self { layer, index }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputSlotRef {
    pub layer: LayerId,
    pub index: usize,
}

impl InputSlotRef {
    pub fn new(layer: LayerId, index: usize) -> Self {
        Self { layer, index }
    }
}

/// Non-owning back-reference to the producer feeding this input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSlot {
    pub(crate) connection: Option<OutputSlotRef>,
}

impl InputSlot {
    pub fn connection(&self) -> Option<OutputSlotRef> {
        self.connection
    }
}

/// Owns the tensor descriptor of one produced value and fans out to its consumers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputSlot {
    pub(crate) info: Option<TensorInfo>,
    pub(crate) consumers: Vec<InputSlotRef>,
}

impl OutputSlot {
    pub fn tensor_info(&self) -> Option<&TensorInfo> {
        self.info.as_ref()
    }

    pub fn consumers(&self) -> &[InputSlotRef] {
        &self.consumers
    }
}

/// Discriminant of [`LayerKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LayerType {
    Input,
    Output,
    Constant,
    Convolution2d,
    FullyConnected,
    Pooling2d,
    Activation,
    Multiplication,
    Addition,
    Softmax,
    Reshape,
    MemCopy,
}

impl LayerType {
    pub const ALL: [LayerType; 12] = [
        LayerType::Input,
        LayerType::Output,
        LayerType::Constant,
        LayerType::Convolution2d,
        LayerType::FullyConnected,
        LayerType::Pooling2d,
        LayerType::Activation,
        LayerType::Multiplication,
        LayerType::Addition,
        LayerType::Softmax,
        LayerType::Reshape,
        LayerType::MemCopy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LayerType::Input => "Input",
            LayerType::Output => "Output",
            LayerType::Constant => "Constant",
            LayerType::Convolution2d => "Convolution2d",
            LayerType::FullyConnected => "FullyConnected",
            LayerType::Pooling2d => "Pooling2d",
            LayerType::Activation => "Activation",
            LayerType::Multiplication => "Multiplication",
            LayerType::Addition => "Addition",
            LayerType::Softmax => "Softmax",
            LayerType::Reshape => "Reshape",
            LayerType::MemCopy => "MemCopy",
        }
    }

    /// Layers that only move data in or out and follow their neighbour's backend.
    pub fn is_boundary(self) -> bool {
        matches!(
            self,
            LayerType::Input | LayerType::Output | LayerType::Constant | LayerType::MemCopy
        )
    }
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ActivationFunction {
    ReLu,
    /// Clamp to `[lower, upper]`.
    BoundedReLu { upper: f32, lower: f32 },
    LeakyReLu { alpha: f32 },
    Sigmoid,
    TanH,
    /// `a * x + b`.
    Linear { a: f32, b: f32 },
}

impl ActivationFunction {
    pub fn apply(&self, x: f32) -> f32 {
        match *self {
            ActivationFunction::ReLu => x.max(0.0),
            ActivationFunction::BoundedReLu { upper, lower } => x.min(upper).max(lower),
            ActivationFunction::LeakyReLu { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            ActivationFunction::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            ActivationFunction::TanH => x.tanh(),
            ActivationFunction::Linear { a, b } => a * x + b,
        }
    }
}

/// NHWC convolution parameters. Weights are laid out `[out_channels, kh, kw, in_channels]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Convolution2dDescriptor {
    pub stride_x: u32,
    pub stride_y: u32,
    pub pad_left: u32,
    pub pad_right: u32,
    pub pad_top: u32,
    pub pad_bottom: u32,
    pub bias_enabled: bool,
    pub fused_activation: Option<ActivationFunction>,
}

impl Default for Convolution2dDescriptor {
    fn default() -> Self {
        Self {
            stride_x: 1,
            stride_y: 1,
            pad_left: 0,
            pad_right: 0,
            pad_top: 0,
            pad_bottom: 0,
            bias_enabled: false,
            fused_activation: None,
        }
    }
}

impl Convolution2dDescriptor {
    pub fn has_padding(&self) -> bool {
        self.pad_left != 0 || self.pad_right != 0 || self.pad_top != 0 || self.pad_bottom != 0
    }
}

/// Weights are `[in, out]`, or `[out, in]` when `transpose_weights` is set. Inputs of rank
/// above two are flattened to `[batch, in]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FullyConnectedDescriptor {
    pub bias_enabled: bool,
    pub transpose_weights: bool,
    pub fused_activation: Option<ActivationFunction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolingAlgorithm {
    Max,
    Average,
    L2,
}

/// How padded positions count towards an average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaddingMethod {
    /// Padding counts as zero-valued elements.
    IgnoreValue,
    /// Padding is left out of the divisor.
    Exclude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputShapeRounding {
    Floor,
    Ceiling,
}

/// NHWC pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pooling2dDescriptor {
    pub algorithm: PoolingAlgorithm,
    pub pool_width: u32,
    pub pool_height: u32,
    pub stride_x: u32,
    pub stride_y: u32,
    pub pad_left: u32,
    pub pad_right: u32,
    pub pad_top: u32,
    pub pad_bottom: u32,
    pub padding_method: PaddingMethod,
    pub rounding: OutputShapeRounding,
}

impl Pooling2dDescriptor {
    /// Unpadded square window with stride equal to its size.
    pub fn new(algorithm: PoolingAlgorithm, size: u32) -> Self {
        Self {
            algorithm,
            pool_width: size,
            pool_height: size,
            stride_x: size,
            stride_y: size,
            pad_left: 0,
            pad_right: 0,
            pad_top: 0,
            pad_bottom: 0,
            padding_method: PaddingMethod::Exclude,
            rounding: OutputShapeRounding::Floor,
        }
    }
}

/// Layer operation together with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    Input {
        binding: u32,
    },
    Output {
        binding: u32,
    },
    Constant {
        tensor: ConstTensor,
    },
    Convolution2d {
        descriptor: Convolution2dDescriptor,
        weights: ConstTensor,
        bias: Option<ConstTensor>,
    },
    FullyConnected {
        descriptor: FullyConnectedDescriptor,
        weights: ConstTensor,
        bias: Option<ConstTensor>,
    },
    Pooling2d {
        descriptor: Pooling2dDescriptor,
    },
    Activation {
        function: ActivationFunction,
    },
    Multiplication,
    Addition,
    Softmax {
        beta: f32,
    },
    Reshape {
        target: TensorShape,
    },
    MemCopy,
}

impl LayerKind {
    pub fn layer_type(&self) -> LayerType {
        match self {
            LayerKind::Input { .. } => LayerType::Input,
            LayerKind::Output { .. } => LayerType::Output,
            LayerKind::Constant { .. } => LayerType::Constant,
            LayerKind::Convolution2d { .. } => LayerType::Convolution2d,
            LayerKind::FullyConnected { .. } => LayerType::FullyConnected,
            LayerKind::Pooling2d { .. } => LayerType::Pooling2d,
            LayerKind::Activation { .. } => LayerType::Activation,
            LayerKind::Multiplication => LayerType::Multiplication,
            LayerKind::Addition => LayerType::Addition,
            LayerKind::Softmax { .. } => LayerType::Softmax,
            LayerKind::Reshape { .. } => LayerType::Reshape,
            LayerKind::MemCopy => LayerType::MemCopy,
        }
    }

    /// Activation folded into a convolution or fully-connected layer, if any.
    pub fn fused_activation(&self) -> Option<ActivationFunction> {
        match self {
            LayerKind::Convolution2d { descriptor, .. } => descriptor.fused_activation,
            LayerKind::FullyConnected { descriptor, .. } => descriptor.fused_activation,
            _ => None,
        }
    }

    /// Checks parameter consistency that does not depend on connected inputs.
    pub(crate) fn check_parameters(&self) -> std::result::Result<(), String> {
        match self {
            LayerKind::Convolution2d {
                descriptor,
                weights,
                bias,
            } => {
                if descriptor.stride_x == 0 || descriptor.stride_y == 0 {
                    return Err("convolution strides must be positive".to_string());
                }
                if weights.info().shape.rank() != 4 {
                    return Err(format!(
                        "convolution weights must be rank 4, got {}",
                        weights.info().shape
                    ));
                }
                check_bias(descriptor.bias_enabled, bias.as_ref(), weights.info().shape[0])
            }
            LayerKind::FullyConnected {
                descriptor,
                weights,
                bias,
            } => {
                if weights.info().shape.rank() != 2 {
                    return Err(format!(
                        "fully connected weights must be rank 2, got {}",
                        weights.info().shape
                    ));
                }
                let out_index = if descriptor.transpose_weights { 0 } else { 1 };
                check_bias(
                    descriptor.bias_enabled,
                    bias.as_ref(),
                    weights.info().shape[out_index],
                )
            }
            LayerKind::Pooling2d { descriptor } => {
                if descriptor.stride_x == 0 || descriptor.stride_y == 0 {
                    return Err("pooling strides must be positive".to_string());
                }
                if descriptor.pool_width == 0 || descriptor.pool_height == 0 {
                    return Err("pooling window must be non-empty".to_string());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn check_bias(
    enabled: bool,
    bias: Option<&ConstTensor>,
    out_channels: u32,
) -> std::result::Result<(), String> {
    match (enabled, bias) {
        (true, Some(bias)) => {
            if bias.info().num_elements() != Some(out_channels as usize) {
                return Err(format!(
                    "bias {} does not match {out_channels} output channels",
                    bias.info().shape
                ));
            }
            Ok(())
        }
        (false, None) => Ok(()),
        (true, None) => Err("bias enabled but no bias tensor given".to_string()),
        (false, Some(_)) => Err("bias tensor given but bias is disabled".to_string()),
    }
}

/// One node of the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub(crate) id: LayerId,
    pub(crate) name: String,
    pub(crate) kind: LayerKind,
    pub(crate) inputs: Vec<InputSlot>,
    pub(crate) outputs: Vec<OutputSlot>,
    pub(crate) backend: Option<BackendId>,
}

impl Layer {
    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    pub fn layer_type(&self) -> LayerType {
        self.kind.layer_type()
    }

    pub fn inputs(&self) -> &[InputSlot] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputSlot] {
        &self.outputs
    }

    pub fn backend(&self) -> Option<BackendId> {
        self.backend
    }

    pub fn output_info(&self, index: usize) -> Option<&TensorInfo> {
        self.outputs.get(index).and_then(|slot| slot.info.as_ref())
    }

    pub fn output_ref(&self, index: usize) -> OutputSlotRef {
        OutputSlotRef::new(self.id, index)
    }

    /// Verifies connections and infers output descriptors from the connected inputs.
    ///
    /// Returns one descriptor per output slot. Pre-assigned descriptors must match the
    /// inferred shape exactly; unassigned ones take the data type and quantization of
    /// input 0 (or of the constant payload).
    pub fn validate_tensor_shapes_from_inputs(&self, graph: &Graph) -> Result<Vec<TensorInfo>> {
        self.kind
            .check_parameters()
            .map_err(|detail| Error::graph_invalid(format!("{}: {detail}", self.name)))?;

        let mut input_infos = Vec::with_capacity(self.inputs.len());
        for (index, slot) in self.inputs.iter().enumerate() {
            let producer = slot.connection.ok_or_else(|| {
                Error::graph_invalid(format!("{}: input slot {index} is not connected", self.name))
            })?;
            let info = graph.tensor_info(producer).ok_or_else(|| {
                Error::graph_invalid(format!(
                    "{}: producer of input slot {index} has no tensor info",
                    self.name
                ))
            })?;
            input_infos.push(info.clone());
        }

        let capability = table::capability(self.layer_type());
        let Some(infer) = capability.infer else {
            return self
                .outputs
                .iter()
                .enumerate()
                .map(|(index, slot)| {
                    slot.info.clone().ok_or_else(|| {
                        Error::graph_invalid(format!(
                            "{}: output slot {index} has no tensor info",
                            self.name
                        ))
                    })
                })
                .collect();
        };

        let shapes: Vec<TensorShape> = input_infos.iter().map(|info| info.shape.clone()).collect();
        let inferred =
            infer(&self.kind, &shapes).map_err(|detail| Error::shape_mismatch(&self.name, detail))?;

        let template = match &self.kind {
            LayerKind::Constant { tensor } => Some(tensor.info().clone()),
            _ => input_infos.first().cloned(),
        };

        let mut validated = Vec::with_capacity(inferred.len());
        for (index, shape) in inferred.into_iter().enumerate() {
            let existing = self.outputs.get(index).and_then(|slot| slot.info.as_ref());
            let info = match (existing, template.as_ref()) {
                (Some(existing), _) => {
                    if existing.shape != shape {
                        return Err(Error::shape_mismatch(
                            &self.name,
                            format!(
                                "tensor shape set on output slot {index} is {}, inferred {shape}",
                                existing.shape
                            ),
                        ));
                    }
                    existing.clone()
                }
                (None, Some(template)) => template.with_shape(shape),
                (None, None) => {
                    return Err(Error::graph_invalid(format!(
                        "{}: cannot infer data type of output slot {index}",
                        self.name
                    )))
                }
            };
            validated.push(info);
        }
        Ok(validated)
    }

    /// Deep-copies parameters and output descriptors into `target`, without connections.
    pub fn clone_into(&self, target: &mut Graph) -> LayerId {
        let id = target.add_layer_unchecked(self.name.clone(), self.kind.clone());
        let layer = target.layer_entry_mut(id);
        for (dst, src) in layer.outputs.iter_mut().zip(&self.outputs) {
            dst.info = src.info.clone();
        }
        layer.backend = self.backend;
        id
    }
}
