//! Backend-agnostic layer graph with static shape inference.

mod arena;
mod builder;
mod layer;
mod table;

pub use arena::Graph;
pub use builder::NetworkBuilder;
pub use layer::{
    ActivationFunction, Convolution2dDescriptor, FullyConnectedDescriptor, InputSlot,
    InputSlotRef, Layer, LayerId, LayerKind, LayerType, OutputShapeRounding, OutputSlot,
    OutputSlotRef, PaddingMethod, Pooling2dDescriptor, PoolingAlgorithm,
};
pub use table::{broadcast_shapes, capability, infer_output_shapes, InferFn, LayerCapability};
