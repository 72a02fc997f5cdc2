use std::sync::Arc;

use graphrt::backend::{
    priority, Backend, BackendCapabilities, BackendError, BackendId, BackendResult, CopyWorkload,
    KernelScheduler, LayerQuery, MemoryDomain, SchedulerCell, SerialScheduler, Support, Workload,
    WorkloadDescriptor, WorkloadFactory,
};
use graphrt::graph::{LayerKind, LayerType};
use graphrt::memory::{HostAllocator, TensorAllocator, TensorHandle};
use graphrt::tensor::{ConstTensor, DataType, TensorInfo};

use crate::kernels;

pub const REF_CPU_ID: BackendId = BackendId::new("ref-cpu");

/// Host snapshot of one tensor as kernels consume it: extents plus `f32` values,
/// dequantized when the tensor is quantized.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuTensor {
    pub info: TensorInfo,
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

impl CpuTensor {
    pub fn from_handle(handle: &TensorHandle) -> BackendResult<Self> {
        Ok(Self {
            info: handle.info().clone(),
            dims: handle.info().shape.to_usize_vec(),
            data: handle.to_f32_vec()?,
        })
    }

    pub fn from_const(tensor: &ConstTensor) -> BackendResult<Self> {
        let data = tensor.to_f32_vec().ok_or_else(|| {
            BackendError::unsupported(
                "constant",
                format!("{:?} constants have no host decoding", tensor.info().data_type),
            )
        })?;
        Ok(Self {
            info: tensor.info().clone(),
            dims: tensor.info().shape.to_usize_vec(),
            data,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A compute layer prepared for CPU execution. Weights and bias are decoded once, when
/// the workload is created.
#[derive(Debug, Clone)]
pub struct CpuLayer {
    pub name: String,
    pub kind: LayerKind,
    pub weights: Option<CpuTensor>,
    pub bias: Option<Vec<f32>>,
    pub output: TensorInfo,
    pub output_dims: Vec<usize>,
}

impl CpuLayer {
    pub fn new(name: String, kind: LayerKind, output: TensorInfo) -> BackendResult<Self> {
        let (weights, bias) = match &kind {
            LayerKind::Convolution2d { weights, bias, .. }
            | LayerKind::FullyConnected { weights, bias, .. } => (
                Some(CpuTensor::from_const(weights)?),
                bias.as_ref()
                    .map(|bias| CpuTensor::from_const(bias).map(|tensor| tensor.data))
                    .transpose()?,
            ),
            _ => (None, None),
        };
        let output_dims = output.shape.to_usize_vec();
        Ok(Self {
            name,
            kind,
            weights,
            bias,
            output,
            output_dims,
        })
    }

    pub fn output_len(&self) -> usize {
        self.output_dims.iter().product()
    }

    pub fn layer_type(&self) -> LayerType {
        self.kind.layer_type()
    }

    /// Decoded weights, or an error naming the layer when it carries none.
    pub fn expect_weights(&self) -> BackendResult<&CpuTensor> {
        self.weights.as_ref().ok_or_else(|| {
            BackendError::execution(format!("{}: layer carries no weights", self.name))
        })
    }
}

/// Hook for backends that reuse the reference workloads but accelerate some layers.
///
/// Returning `None` from either method falls back to the reference behaviour.
pub trait CpuKernelInterceptor: Send + Sync + 'static {
    fn is_supported(&self, _query: &LayerQuery<'_>) -> Option<Support> {
        None
    }

    fn try_execute(
        &self,
        layer: &CpuLayer,
        inputs: &[CpuTensor],
        scheduler: &dyn KernelScheduler,
        dst: &mut [f32],
    ) -> Option<BackendResult<()>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInterceptor;

impl CpuKernelInterceptor for NoopInterceptor {
    fn try_execute(
        &self,
        _layer: &CpuLayer,
        _inputs: &[CpuTensor],
        _scheduler: &dyn KernelScheduler,
        _dst: &mut [f32],
    ) -> Option<BackendResult<()>> {
        None
    }
}

/// Support check of the reference kernels.
///
/// Data movement layers accept every host-decodable type. Compute layers run in `f32` and
/// accept `Float32` and `QAsymmU8` tensors. `Float16` is rejected everywhere.
pub fn reference_support(query: &LayerQuery<'_>) -> Support {
    let layer_type = query.kind.layer_type();
    let mut infos = query.inputs.iter().chain(query.outputs);
    if infos.any(|info| info.data_type == DataType::Float16) {
        return Support::unsupported(format!("{layer_type}: f16 tensors have no CPU kernels"));
    }
    if matches!(
        layer_type,
        LayerType::Input
            | LayerType::Output
            | LayerType::Constant
            | LayerType::MemCopy
            | LayerType::Reshape
    ) {
        return Support::Supported;
    }

    if let Some(info) = query
        .inputs
        .iter()
        .chain(query.outputs)
        .find(|info| !matches!(info.data_type, DataType::Float32 | DataType::QAsymmU8))
    {
        return Support::unsupported(format!(
            "{layer_type}: {} tensors are not supported",
            info.data_type.as_str()
        ));
    }

    match query.kind {
        LayerKind::Convolution2d { weights, .. } => {
            let Some(input) = query.inputs.first() else {
                return Support::unsupported("convolution has no input");
            };
            if input.shape.rank() != 4 {
                return Support::unsupported(format!(
                    "convolution expects an NHWC input, got {}",
                    input.shape
                ));
            }
            if weights.info().data_type == DataType::Float16 {
                return Support::unsupported("f16 convolution weights");
            }
            if weights.info().shape[3] != input.shape[3] {
                return Support::unsupported(format!(
                    "weights {} do not match {} input channels",
                    weights.info().shape,
                    input.shape[3]
                ));
            }
            Support::Supported
        }
        LayerKind::FullyConnected { weights, .. } => {
            if weights.info().data_type == DataType::Float16 {
                return Support::unsupported("f16 fully connected weights");
            }
            Support::Supported
        }
        LayerKind::Pooling2d { .. } => match query.inputs.first() {
            Some(input) if input.shape.rank() == 4 => Support::Supported,
            Some(input) => Support::unsupported(format!(
                "pooling expects an NHWC input, got {}",
                input.shape
            )),
            None => Support::unsupported("pooling has no input"),
        },
        _ => Support::Supported,
    }
}

/// Factory shared by every CPU backend built on the reference kernels.
pub struct CpuWorkloadFactory<I: CpuKernelInterceptor> {
    interceptor: Arc<I>,
    scheduler: Arc<SchedulerCell>,
}

impl<I: CpuKernelInterceptor> CpuWorkloadFactory<I> {
    pub fn new(interceptor: Arc<I>, scheduler: Arc<SchedulerCell>) -> Self {
        Self {
            interceptor,
            scheduler,
        }
    }
}

impl<I: CpuKernelInterceptor> WorkloadFactory for CpuWorkloadFactory<I> {
    fn is_supported(&self, query: &LayerQuery<'_>) -> Support {
        self.interceptor
            .is_supported(query)
            .unwrap_or_else(|| reference_support(query))
    }

    fn create_workload(&self, descriptor: WorkloadDescriptor) -> BackendResult<Box<dyn Workload>> {
        match descriptor.kind.layer_type() {
            LayerType::MemCopy | LayerType::Reshape => Ok(Box::new(CopyWorkload::new(descriptor)?)),
            LayerType::Input | LayerType::Output | LayerType::Constant => {
                Err(BackendError::unsupported(
                    descriptor.kind.layer_type().as_str(),
                    format!("{}: bound by the engine, not executed", descriptor.name),
                ))
            }
            _ => Ok(Box::new(CpuWorkload::new(
                descriptor,
                Arc::clone(&self.interceptor),
                Arc::clone(&self.scheduler),
            )?)),
        }
    }
}

/// Snapshots its inputs, runs one kernel through the backend's active scheduler and stores
/// the result, quantizing when the output is quantized.
struct CpuWorkload<I: CpuKernelInterceptor> {
    layer: CpuLayer,
    inputs: Vec<TensorHandle>,
    output: TensorHandle,
    interceptor: Arc<I>,
    scheduler: Arc<SchedulerCell>,
}

impl<I: CpuKernelInterceptor> CpuWorkload<I> {
    fn new(
        descriptor: WorkloadDescriptor,
        interceptor: Arc<I>,
        scheduler: Arc<SchedulerCell>,
    ) -> BackendResult<Self> {
        let arity = match descriptor.kind {
            LayerKind::Addition | LayerKind::Multiplication => 2,
            _ => 1,
        };
        descriptor.expect_arity(arity, 1)?;
        let WorkloadDescriptor {
            name,
            kind,
            inputs,
            mut outputs,
        } = descriptor;
        let output = outputs.remove(0);
        let layer = CpuLayer::new(name, kind, output.info().clone())?;
        Ok(Self {
            layer,
            inputs,
            output,
            interceptor,
            scheduler,
        })
    }
}

impl<I: CpuKernelInterceptor> Workload for CpuWorkload<I> {
    fn name(&self) -> &str {
        &self.layer.name
    }

    fn execute(&mut self) -> BackendResult<()> {
        let inputs = self
            .inputs
            .iter()
            .map(CpuTensor::from_handle)
            .collect::<BackendResult<Vec<_>>>()?;
        let mut dst = vec![0.0f32; self.layer.output_len()];
        let scheduler = self.scheduler.current();

        match self
            .interceptor
            .try_execute(&self.layer, &inputs, scheduler.as_ref(), &mut dst)
        {
            Some(result) => result?,
            None => kernels::dispatch(&self.layer, &inputs, scheduler.as_ref(), &mut dst)?,
        }
        self.output.write_f32(&dst)
    }
}

/// CPU backend parameterized by a kernel interceptor.
pub struct GenericCpuBackend<I: CpuKernelInterceptor> {
    id: BackendId,
    priority: u32,
    factory: CpuWorkloadFactory<I>,
    allocator: Arc<HostAllocator>,
    scheduler: Arc<SchedulerCell>,
}

impl<I: CpuKernelInterceptor> GenericCpuBackend<I> {
    /// Reference identity (`ref-cpu`) on a serial scheduler.
    pub fn with_interceptor(interceptor: I) -> Self {
        Self::with_parts(
            REF_CPU_ID,
            priority::REFERENCE,
            interceptor,
            Arc::new(SerialScheduler::new()),
        )
    }

    pub fn with_parts(
        id: BackendId,
        priority: u32,
        interceptor: I,
        scheduler: Arc<dyn KernelScheduler>,
    ) -> Self {
        let scheduler = Arc::new(SchedulerCell::new(scheduler));
        Self {
            id,
            priority,
            factory: CpuWorkloadFactory::new(Arc::new(interceptor), Arc::clone(&scheduler)),
            allocator: Arc::new(HostAllocator::default()),
            scheduler,
        }
    }

    /// Caps the bytes this backend's allocator hands out.
    pub fn with_memory_capacity(mut self, bytes: usize) -> Self {
        self.allocator = Arc::new(HostAllocator::default().with_capacity(bytes));
        self
    }
}

impl<I: CpuKernelInterceptor> Backend for GenericCpuBackend<I> {
    fn id(&self) -> BackendId {
        self.id
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            memory_domain: MemoryDomain::Host,
            priority: self.priority,
        }
    }

    fn factory(&self) -> &dyn WorkloadFactory {
        &self.factory
    }

    fn allocator(&self) -> Arc<dyn TensorAllocator> {
        Arc::clone(&self.allocator) as Arc<dyn TensorAllocator>
    }

    fn scheduler(&self) -> Arc<SchedulerCell> {
        Arc::clone(&self.scheduler)
    }
}

/// Reference CPU backend.
pub type CpuBackend = GenericCpuBackend<NoopInterceptor>;

impl CpuBackend {
    pub fn new() -> Self {
        Self::with_interceptor(NoopInterceptor)
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}
