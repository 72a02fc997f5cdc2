use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::layer::{InputSlot, InputSlotRef, Layer, LayerId, LayerKind, OutputSlot, OutputSlotRef};
use super::table;
use crate::backend::BackendId;
use crate::error::{Error, Result};
use crate::tensor::TensorInfo;

/// Directed acyclic graph of layers, owned in an id-keyed arena.
///
/// Edges are stored on both ends: each input slot names its single producer and each
/// output slot lists its consumers. All mutation goes through methods that keep the two
/// sides consistent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    layers: BTreeMap<LayerId, Layer>,
    next_id: u32,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Adds a layer with the arity fixed by its type. Parameters are checked up front.
    pub fn add_layer(&mut self, name: impl Into<String>, kind: LayerKind) -> Result<LayerId> {
        let name = name.into();
        kind.check_parameters()
            .map_err(|detail| Error::graph_invalid(format!("{name}: {detail}")))?;
        Ok(self.add_layer_unchecked(name, kind))
    }

    pub(crate) fn add_layer_unchecked(&mut self, name: String, kind: LayerKind) -> LayerId {
        let capability = table::capability(kind.layer_type());
        let id = LayerId(self.next_id);
        self.next_id += 1;
        self.layers.insert(
            id,
            Layer {
                id,
                name,
                kind,
                inputs: vec![InputSlot::default(); capability.inputs],
                outputs: vec![OutputSlot::default(); capability.outputs],
                backend: None,
            },
        );
        id
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.get(&id)
    }

    pub(crate) fn layer_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.layers.get_mut(&id)
    }

    pub(crate) fn layer_entry_mut(&mut self, id: LayerId) -> &mut Layer {
        self.layers.get_mut(&id).expect("layer id must be valid")
    }

    /// Layers in ascending id order.
    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.values()
    }

    pub fn layer_ids(&self) -> Vec<LayerId> {
        self.layers.keys().copied().collect()
    }

    fn require(&self, id: LayerId) -> Result<&Layer> {
        self.layers
            .get(&id)
            .ok_or_else(|| Error::graph_invalid(format!("unknown layer {id}")))
    }

    fn check_output(&self, slot: OutputSlotRef) -> Result<()> {
        let layer = self.require(slot.layer)?;
        if slot.index >= layer.outputs.len() {
            return Err(Error::graph_invalid(format!(
                "{} has no output slot {}",
                layer.name, slot.index
            )));
        }
        Ok(())
    }

    fn check_input(&self, slot: InputSlotRef) -> Result<()> {
        let layer = self.require(slot.layer)?;
        if slot.index >= layer.inputs.len() {
            return Err(Error::graph_invalid(format!(
                "{} has no input slot {}",
                layer.name, slot.index
            )));
        }
        Ok(())
    }

    /// Connects a producer to a consumer input. An input accepts exactly one producer.
    pub fn connect(&mut self, from: OutputSlotRef, to: InputSlotRef) -> Result<()> {
        self.check_output(from)?;
        self.check_input(to)?;
        let consumer = self.layer_entry_mut(to.layer);
        if let Some(existing) = consumer.inputs[to.index].connection {
            return Err(Error::graph_invalid(format!(
                "{} input slot {} is already connected to {}:{}",
                consumer.name, to.index, existing.layer, existing.index
            )));
        }
        consumer.inputs[to.index].connection = Some(from);
        self.layer_entry_mut(from.layer).outputs[from.index]
            .consumers
            .push(to);
        Ok(())
    }

    /// Detaches an input from its producer, returning the former producer.
    pub fn disconnect(&mut self, to: InputSlotRef) -> Result<Option<OutputSlotRef>> {
        self.check_input(to)?;
        let previous = self.layer_entry_mut(to.layer).inputs[to.index]
            .connection
            .take();
        if let Some(from) = previous {
            if let Some(producer) = self.layers.get_mut(&from.layer) {
                producer.outputs[from.index]
                    .consumers
                    .retain(|consumer| *consumer != to);
            }
        }
        Ok(previous)
    }

    /// Removes a layer and every edge touching it.
    pub fn erase_layer(&mut self, id: LayerId) -> Result<Layer> {
        let layer = self.require(id)?;
        let input_count = layer.inputs.len();
        let consumers: Vec<InputSlotRef> = layer
            .outputs
            .iter()
            .flat_map(|slot| slot.consumers.iter().copied())
            .collect();
        for index in 0..input_count {
            self.disconnect(InputSlotRef::new(id, index))?;
        }
        for consumer in consumers {
            self.disconnect(consumer)?;
        }
        self.layers
            .remove(&id)
            .ok_or_else(|| Error::graph_invalid(format!("unknown layer {id}")))
    }

    /// Moves every consumer of `from` over to `to`.
    pub fn reroute_consumers(&mut self, from: OutputSlotRef, to: OutputSlotRef) -> Result<()> {
        self.check_output(from)?;
        self.check_output(to)?;
        let consumers = self.consumers_of(from).to_vec();
        for consumer in consumers {
            self.disconnect(consumer)?;
            self.connect(to, consumer)?;
        }
        Ok(())
    }

    /// Splices a single-input, single-output layer into the edge `producer -> consumer`.
    pub fn insert_between(
        &mut self,
        producer: OutputSlotRef,
        consumer: InputSlotRef,
        name: impl Into<String>,
        kind: LayerKind,
    ) -> Result<LayerId> {
        if self.producer_of(consumer) != Some(producer) {
            return Err(Error::graph_invalid(format!(
                "{}:{} does not feed {}:{}",
                producer.layer, producer.index, consumer.layer, consumer.index
            )));
        }
        let capability = table::capability(kind.layer_type());
        if capability.inputs != 1 || capability.outputs != 1 {
            return Err(Error::graph_invalid(format!(
                "{} cannot be spliced into an edge",
                kind.layer_type()
            )));
        }
        let id = self.add_layer(name, kind)?;
        let info = self.tensor_info(producer).cloned();
        self.disconnect(consumer)?;
        self.connect(producer, InputSlotRef::new(id, 0))?;
        self.connect(OutputSlotRef::new(id, 0), consumer)?;
        self.layer_entry_mut(id).outputs[0].info = info;
        Ok(id)
    }

    pub fn producer_of(&self, input: InputSlotRef) -> Option<OutputSlotRef> {
        self.layers
            .get(&input.layer)
            .and_then(|layer| layer.inputs.get(input.index))
            .and_then(|slot| slot.connection)
    }

    pub fn consumers_of(&self, output: OutputSlotRef) -> &[InputSlotRef] {
        self.layers
            .get(&output.layer)
            .and_then(|layer| layer.outputs.get(output.index))
            .map(|slot| slot.consumers.as_slice())
            .unwrap_or(&[])
    }

    pub fn tensor_info(&self, output: OutputSlotRef) -> Option<&TensorInfo> {
        self.layers
            .get(&output.layer)
            .and_then(|layer| layer.outputs.get(output.index))
            .and_then(|slot| slot.info.as_ref())
    }

    pub fn set_tensor_info(&mut self, output: OutputSlotRef, info: TensorInfo) -> Result<()> {
        self.check_output(output)?;
        self.layer_entry_mut(output.layer).outputs[output.index].info = Some(info);
        Ok(())
    }

    pub fn set_backend(&mut self, id: LayerId, backend: BackendId) -> Result<()> {
        self.require(id)?;
        self.layer_entry_mut(id).backend = Some(backend);
        Ok(())
    }

    /// Runs shape inference for one layer and stores the validated output descriptors.
    pub fn validate_layer(&mut self, id: LayerId) -> Result<()> {
        let infos = self.require(id)?.validate_tensor_shapes_from_inputs(self)?;
        let layer = self.layer_entry_mut(id);
        for (slot, info) in layer.outputs.iter_mut().zip(infos) {
            slot.info = Some(info);
        }
        Ok(())
    }

    /// Input layers ordered by binding id.
    pub fn input_layers(&self) -> Vec<LayerId> {
        let mut inputs: Vec<(u32, LayerId)> = self
            .layers
            .values()
            .filter_map(|layer| match layer.kind {
                LayerKind::Input { binding } => Some((binding, layer.id)),
                _ => None,
            })
            .collect();
        inputs.sort();
        inputs.into_iter().map(|(_, id)| id).collect()
    }

    /// Output layers ordered by binding id.
    pub fn output_layers(&self) -> Vec<LayerId> {
        let mut outputs: Vec<(u32, LayerId)> = self
            .layers
            .values()
            .filter_map(|layer| match layer.kind {
                LayerKind::Output { binding } => Some((binding, layer.id)),
                _ => None,
            })
            .collect();
        outputs.sort();
        outputs.into_iter().map(|(_, id)| id).collect()
    }

    /// Kahn's algorithm; among ready layers the lowest id goes first, so the order is
    /// stable for a given graph.
    pub fn topological_order(&self) -> Result<Vec<LayerId>> {
        let mut indegree: BTreeMap<LayerId, usize> = BTreeMap::new();
        for layer in self.layers.values() {
            let connected = layer
                .inputs
                .iter()
                .filter(|slot| slot.connection.is_some())
                .count();
            indegree.insert(layer.id, connected);
        }

        let mut ready: BTreeSet<LayerId> = indegree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(self.layers.len());

        while let Some(id) = ready.pop_first() {
            order.push(id);
            for slot in &self.layers[&id].outputs {
                for consumer in &slot.consumers {
                    if let Some(degree) = indegree.get_mut(&consumer.layer) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.insert(consumer.layer);
                        }
                    }
                }
            }
        }

        if order.len() != self.layers.len() {
            let stuck: Vec<String> = indegree
                .iter()
                .filter(|(_, &degree)| degree > 0)
                .map(|(id, _)| self.layers[id].name.clone())
                .collect();
            return Err(Error::graph_invalid(format!(
                "graph contains a cycle through {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    /// Structural checks: every input connected, arity respected, bindings unique, acyclic.
    pub fn verify(&self) -> Result<()> {
        let mut input_bindings = HashSet::new();
        let mut output_bindings = HashSet::new();
        for layer in self.layers.values() {
            let capability = table::capability(layer.layer_type());
            if layer.inputs.len() != capability.inputs || layer.outputs.len() != capability.outputs
            {
                return Err(Error::graph_invalid(format!(
                    "{}: {} expects {} inputs and {} outputs",
                    layer.name,
                    layer.layer_type(),
                    capability.inputs,
                    capability.outputs
                )));
            }
            for (index, slot) in layer.inputs.iter().enumerate() {
                let Some(from) = slot.connection else {
                    return Err(Error::graph_invalid(format!(
                        "{}: input slot {index} is not connected",
                        layer.name
                    )));
                };
                let listed = self
                    .consumers_of(from)
                    .iter()
                    .filter(|consumer| **consumer == InputSlotRef::new(layer.id, index))
                    .count();
                if listed != 1 {
                    return Err(Error::graph_invalid(format!(
                        "{}: input slot {index} is not registered exactly once with its producer",
                        layer.name
                    )));
                }
            }
            match layer.kind {
                LayerKind::Input { binding } if !input_bindings.insert(binding) => {
                    return Err(Error::graph_invalid(format!(
                        "input binding {binding} is used twice"
                    )));
                }
                LayerKind::Output { binding } if !output_bindings.insert(binding) => {
                    return Err(Error::graph_invalid(format!(
                        "output binding {binding} is used twice"
                    )));
                }
                _ => {}
            }
        }
        self.topological_order().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ActivationFunction;

    fn relu() -> LayerKind {
        LayerKind::Activation {
            function: ActivationFunction::ReLu,
        }
    }

    #[test]
    fn topological_order_breaks_ties_by_id() {
        let mut graph = Graph::new();
        let input = graph.add_layer("in", LayerKind::Input { binding: 0 }).unwrap();
        let b = graph.add_layer("b", relu()).unwrap();
        let a = graph.add_layer("a", relu()).unwrap();
        let add = graph.add_layer("add", LayerKind::Addition).unwrap();
        graph.connect(OutputSlotRef::new(input, 0), InputSlotRef::new(a, 0)).unwrap();
        graph.connect(OutputSlotRef::new(input, 0), InputSlotRef::new(b, 0)).unwrap();
        graph.connect(OutputSlotRef::new(a, 0), InputSlotRef::new(add, 0)).unwrap();
        graph.connect(OutputSlotRef::new(b, 0), InputSlotRef::new(add, 1)).unwrap();

        assert_eq!(graph.topological_order().unwrap(), vec![input, b, a, add]);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut graph = Graph::new();
        let a = graph.add_layer("a", relu()).unwrap();
        let b = graph.add_layer("b", relu()).unwrap();
        graph.connect(OutputSlotRef::new(a, 0), InputSlotRef::new(b, 0)).unwrap();
        graph.connect(OutputSlotRef::new(b, 0), InputSlotRef::new(a, 0)).unwrap();
        assert!(matches!(graph.topological_order(), Err(Error::GraphInvalid(_))));
    }

    #[test]
    fn inputs_accept_one_producer() {
        let mut graph = Graph::new();
        let x = graph.add_layer("x", LayerKind::Input { binding: 0 }).unwrap();
        let y = graph.add_layer("y", LayerKind::Input { binding: 1 }).unwrap();
        let act = graph.add_layer("act", relu()).unwrap();
        graph.connect(OutputSlotRef::new(x, 0), InputSlotRef::new(act, 0)).unwrap();
        assert!(graph
            .connect(OutputSlotRef::new(y, 0), InputSlotRef::new(act, 0))
            .is_err());

        graph.erase_layer(x).unwrap();
        assert_eq!(graph.producer_of(InputSlotRef::new(act, 0)), None);
        assert!(graph.verify().is_err());
    }
}
