use super::arena::Graph;
use super::layer::{
    ActivationFunction, Convolution2dDescriptor, FullyConnectedDescriptor, InputSlotRef, LayerId,
    LayerKind, OutputSlotRef, Pooling2dDescriptor,
};
use crate::error::{Error, Result};
use crate::tensor::{ConstTensor, TensorInfo, TensorShape};

/// Graph-construction interface consumed by model importers.
#[derive(Debug, Default)]
pub struct NetworkBuilder {
    graph: Graph,
}

impl NetworkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph input bound by `binding` at run time; its descriptor is fixed here.
    pub fn add_input(&mut self, name: &str, binding: u32, info: TensorInfo) -> Result<LayerId> {
        let id = self.graph.add_layer(name, LayerKind::Input { binding })?;
        self.graph.set_tensor_info(OutputSlotRef::new(id, 0), info)?;
        Ok(id)
    }

    pub fn add_output(&mut self, name: &str, binding: u32) -> Result<LayerId> {
        self.graph.add_layer(name, LayerKind::Output { binding })
    }

    pub fn add_constant(&mut self, name: &str, tensor: ConstTensor) -> Result<LayerId> {
        self.graph.add_layer(name, LayerKind::Constant { tensor })
    }

    pub fn add_convolution2d(
        &mut self,
        name: &str,
        descriptor: Convolution2dDescriptor,
        weights: ConstTensor,
        bias: Option<ConstTensor>,
    ) -> Result<LayerId> {
        self.graph.add_layer(
            name,
            LayerKind::Convolution2d {
                descriptor,
                weights,
                bias,
            },
        )
    }

    pub fn add_fully_connected(
        &mut self,
        name: &str,
        descriptor: FullyConnectedDescriptor,
        weights: ConstTensor,
        bias: Option<ConstTensor>,
    ) -> Result<LayerId> {
        self.graph.add_layer(
            name,
            LayerKind::FullyConnected {
                descriptor,
                weights,
                bias,
            },
        )
    }

    pub fn add_pooling2d(&mut self, name: &str, descriptor: Pooling2dDescriptor) -> Result<LayerId> {
        self.graph.add_layer(name, LayerKind::Pooling2d { descriptor })
    }

    pub fn add_activation(&mut self, name: &str, function: ActivationFunction) -> Result<LayerId> {
        self.graph.add_layer(name, LayerKind::Activation { function })
    }

    pub fn add_multiplication(&mut self, name: &str) -> Result<LayerId> {
        self.graph.add_layer(name, LayerKind::Multiplication)
    }

    pub fn add_addition(&mut self, name: &str) -> Result<LayerId> {
        self.graph.add_layer(name, LayerKind::Addition)
    }

    pub fn add_softmax(&mut self, name: &str, beta: f32) -> Result<LayerId> {
        self.graph.add_layer(name, LayerKind::Softmax { beta })
    }

    pub fn add_reshape(&mut self, name: &str, target: TensorShape) -> Result<LayerId> {
        self.graph.add_layer(name, LayerKind::Reshape { target })
    }

    pub fn connect(&mut self, from: OutputSlotRef, to: InputSlotRef) -> Result<()> {
        self.graph.connect(from, to)
    }

    /// Connects output 0 of `from` to the first unconnected input of `to`.
    pub fn link(&mut self, from: LayerId, to: LayerId) -> Result<()> {
        let layer = self
            .graph
            .layer(to)
            .ok_or_else(|| Error::graph_invalid(format!("unknown layer {to}")))?;
        let index = layer
            .inputs()
            .iter()
            .position(|slot| slot.connection().is_none())
            .ok_or_else(|| {
                Error::graph_invalid(format!("{} has no free input slot", layer.name()))
            })?;
        self.graph
            .connect(OutputSlotRef::new(from, 0), InputSlotRef::new(to, index))
    }

    /// Pins the descriptor of an output slot; shape inference must agree with it.
    pub fn set_tensor_info(&mut self, slot: OutputSlotRef, info: TensorInfo) -> Result<()> {
        self.graph.set_tensor_info(slot, info)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Verifies structure and hands over the graph.
    pub fn finish(self) -> Result<Graph> {
        self.graph.verify()?;
        Ok(self.graph)
    }
}
