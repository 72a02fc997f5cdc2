#![allow(dead_code)]

use std::ops::Range;
use std::sync::{Arc, Mutex};

use graphrt::backend::{
    Backend, BackendCapabilities, BackendError, BackendId, BackendResult, CopyWorkload, Kernel,
    LayerQuery, MemoryDomain, ScheduleHints, SchedulerCell, SerialScheduler, Support, Workload,
    WorkloadDescriptor, WorkloadFactory,
};
use graphrt::graph::{ActivationFunction, Graph, LayerKind, LayerType, NetworkBuilder};
use graphrt::memory::{HostAllocator, TensorAllocator, TensorHandle};
use graphrt::tensor::{DataType, HostTensor, TensorInfo, TensorShape};
use graphrt::{BackendRegistry, EngineConfig, ExecutionEngine};

/// Host-memory test backend running elementwise layers in plain loops.
pub struct MockBackend {
    id: BackendId,
    priority: u32,
    domain: MemoryDomain,
    supported: Vec<LayerType>,
    fail_on: Option<String>,
    refuse_on: Option<String>,
    allocator: Arc<HostAllocator>,
    scheduler: Arc<SchedulerCell>,
    created: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new(id: &'static str, priority: u32) -> Self {
        Self {
            id: BackendId::new(id),
            priority,
            domain: MemoryDomain::Host,
            supported: vec![
                LayerType::Activation,
                LayerType::Addition,
                LayerType::Multiplication,
                LayerType::Reshape,
                LayerType::MemCopy,
            ],
            fail_on: None,
            refuse_on: None,
            allocator: Arc::new(HostAllocator::default()),
            scheduler: Arc::new(SchedulerCell::new(Arc::new(SerialScheduler::new()))),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn in_domain(mut self, domain: MemoryDomain) -> Self {
        self.domain = domain;
        self
    }

    /// Restricts compute support to `types`. Copies and reshapes stay supported.
    pub fn supporting(mut self, types: &[LayerType]) -> Self {
        self.supported = types.to_vec();
        self.supported.extend([LayerType::Reshape, LayerType::MemCopy]);
        self
    }

    pub fn failing_on(mut self, layer: &str) -> Self {
        self.fail_on = Some(layer.to_string());
        self
    }

    /// Accepts `layer` during assignment but refuses to create its workload.
    pub fn refusing_to_create(mut self, layer: &str) -> Self {
        self.refuse_on = Some(layer.to_string());
        self
    }

    pub fn with_allocator(mut self, allocator: HostAllocator) -> Self {
        self.allocator = Arc::new(allocator);
        self
    }

    pub fn created_workloads(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

impl WorkloadFactory for MockBackend {
    fn is_supported(&self, query: &LayerQuery<'_>) -> Support {
        let layer_type = query.kind.layer_type();
        if !self.supported.contains(&layer_type) {
            return Support::unsupported(format!("{layer_type} not implemented"));
        }
        if matches!(layer_type, LayerType::MemCopy | LayerType::Reshape) {
            return Support::Supported;
        }
        match query
            .inputs
            .iter()
            .chain(query.outputs)
            .find(|info| info.data_type != DataType::Float32)
        {
            Some(info) => Support::unsupported(format!("{:?} tensors", info.data_type)),
            None => Support::Supported,
        }
    }

    fn create_workload(&self, descriptor: WorkloadDescriptor) -> BackendResult<Box<dyn Workload>> {
        self.created.lock().unwrap().push(descriptor.name.clone());
        if self.refuse_on.as_deref() == Some(descriptor.name.as_str()) {
            return Err(BackendError::unsupported(
                descriptor.kind.layer_type().as_str(),
                "weights are not resident",
            ));
        }
        match descriptor.kind.layer_type() {
            LayerType::MemCopy | LayerType::Reshape => Ok(Box::new(CopyWorkload::new(descriptor)?)),
            _ => {
                let arity = match descriptor.kind {
                    LayerKind::Addition | LayerKind::Multiplication => 2,
                    _ => 1,
                };
                descriptor.expect_arity(arity, 1)?;
                let fail = self.fail_on.as_deref() == Some(descriptor.name.as_str());
                Ok(Box::new(MockWorkload {
                    fail,
                    descriptor,
                    scheduler: Arc::clone(&self.scheduler),
                }))
            }
        }
    }
}

impl Backend for MockBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            memory_domain: self.domain,
            priority: self.priority,
        }
    }

    fn factory(&self) -> &dyn WorkloadFactory {
        self
    }

    fn allocator(&self) -> Arc<dyn TensorAllocator> {
        Arc::clone(&self.allocator) as Arc<dyn TensorAllocator>
    }

    fn scheduler(&self) -> Arc<SchedulerCell> {
        Arc::clone(&self.scheduler)
    }
}

struct MockWorkload {
    descriptor: WorkloadDescriptor,
    scheduler: Arc<SchedulerCell>,
    fail: bool,
}

impl Workload for MockWorkload {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn execute(&mut self) -> BackendResult<()> {
        if self.fail {
            return Err(BackendError::execution(format!(
                "{} failed on purpose",
                self.descriptor.name
            )));
        }
        let inputs = self
            .descriptor
            .inputs
            .iter()
            .map(|handle| Ok((handle.to_f32_vec()?, dims(handle))))
            .collect::<BackendResult<Vec<_>>>()?;
        let output: &TensorHandle = &self.descriptor.outputs[0];
        let kernel = ElementwiseKernel {
            kind: &self.descriptor.kind,
            inputs: &inputs,
            out_dims: dims(output),
        };
        let mut dst = vec![0.0; kernel.row_len()];
        self.scheduler
            .current()
            .schedule(&kernel, &ScheduleHints::default(), &mut dst)?;
        output.write_f32(&dst)
    }
}

fn dims(handle: &TensorHandle) -> Vec<usize> {
    handle.info().shape.to_usize_vec()
}

/// Whole output as a single row.
struct ElementwiseKernel<'a> {
    kind: &'a LayerKind,
    inputs: &'a [(Vec<f32>, Vec<usize>)],
    out_dims: Vec<usize>,
}

impl ElementwiseKernel<'_> {
    /// Value of input `which` at the output coordinate `index`, broadcasting extent-1 axes.
    fn read(&self, which: usize, index: usize) -> f32 {
        let (values, dims) = &self.inputs[which];
        let mut rest = index;
        let mut offset = 0;
        let mut stride = 1;
        for (axis, &out) in self.out_dims.iter().enumerate().rev() {
            let coord = rest % out;
            rest /= out;
            let extent = dims[axis];
            if extent != 1 {
                offset += coord * stride;
            }
            stride *= extent;
        }
        values[offset]
    }
}

impl Kernel for ElementwiseKernel<'_> {
    fn name(&self) -> &str {
        "MockElementwise"
    }

    fn rows(&self) -> usize {
        1
    }

    fn row_len(&self) -> usize {
        self.out_dims.iter().product()
    }

    fn run(&self, rows: Range<usize>, dst: &mut [f32]) -> BackendResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        for (index, value) in dst.iter_mut().enumerate() {
            *value = match self.kind {
                LayerKind::Activation { function } => function.apply(self.read(0, index)),
                LayerKind::Addition => self.read(0, index) + self.read(1, index),
                LayerKind::Multiplication => self.read(0, index) * self.read(1, index),
                other => {
                    return Err(BackendError::unsupported(
                        other.layer_type().as_str(),
                        "mock kernels are elementwise only",
                    ))
                }
            };
        }
        Ok(())
    }
}

pub fn registry_with(backends: Vec<Arc<dyn Backend>>) -> BackendRegistry {
    let registry = BackendRegistry::new();
    for backend in backends {
        registry.register(backend);
    }
    registry
}

pub fn built_engine(
    graph: Graph,
    backend: Arc<dyn Backend>,
    config: EngineConfig,
) -> graphrt::Result<ExecutionEngine> {
    let registry = registry_with(vec![backend]);
    let mut engine = ExecutionEngine::new(graph, &registry, config)?;
    engine.build()?;
    Ok(engine)
}

pub fn f32_tensor(dims: &[u32], values: &[f32]) -> HostTensor {
    HostTensor::from_f32(TensorShape::from_dims(dims), values).unwrap()
}

pub fn output_values(outputs: &[(u32, HostTensor)], binding: u32) -> Vec<f32> {
    outputs
        .iter()
        .find(|(id, _)| *id == binding)
        .and_then(|(_, tensor)| tensor.to_f32_vec())
        .unwrap()
}

/// input 0 -> relu -> linear(2x + 1) -> output 0.
pub fn activation_chain(dims: &[u32]) -> Graph {
    let mut builder = NetworkBuilder::new();
    let x = builder.add_input("input", 0, TensorInfo::f32(dims)).unwrap();
    let relu = builder.add_activation("relu", ActivationFunction::ReLu).unwrap();
    let linear = builder
        .add_activation("linear", ActivationFunction::Linear { a: 2.0, b: 1.0 })
        .unwrap();
    let out = builder.add_output("output", 0).unwrap();
    builder.link(x, relu).unwrap();
    builder.link(relu, linear).unwrap();
    builder.link(linear, out).unwrap();
    builder.finish().unwrap()
}

/// inputs 0 and 1 -> add -> output 0.
pub fn addition_graph(lhs: &[u32], rhs: &[u32]) -> graphrt::Result<Graph> {
    let mut builder = NetworkBuilder::new();
    let a = builder.add_input("a", 0, TensorInfo::f32(lhs))?;
    let b = builder.add_input("b", 1, TensorInfo::f32(rhs))?;
    let add = builder.add_addition("add")?;
    let out = builder.add_output("output", 0)?;
    builder.link(a, add)?;
    builder.link(b, add)?;
    builder.link(add, out)?;
    builder.finish()
}
