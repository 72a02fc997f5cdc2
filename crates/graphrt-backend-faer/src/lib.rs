//! Vectorized CPU backend.
//!
//! Convolution and fully connected layers run as faer GEMMs; every other layer reuses the
//! reference kernels. All kernels dispatch through a [`RayonScheduler`], so rows are split
//! across the configured number of threads.

mod gemm;
mod scheduler;

use std::sync::Arc;

use graphrt::backend::{
    priority, Backend, BackendCapabilities, BackendId, BackendRegistry, BackendResult,
    KernelScheduler, ScheduleHints, SchedulerCell, WorkloadFactory,
};
use graphrt::graph::LayerKind;
use graphrt::memory::TensorAllocator;
use graphrt::tensor::DataType;
use graphrt_backend_ref_cpu::kernels::expect_input;
use graphrt_backend_ref_cpu::{CpuKernelInterceptor, CpuLayer, CpuTensor, GenericCpuBackend};

pub use gemm::{ConvGemmKernel, ConvStrategy, FullyConnectedGemmKernel};
pub use scheduler::{default_thread_count, RayonScheduler};

pub const FAER_ID: BackendId = BackendId::new("faer");

/// Routes `f32` convolution and fully connected layers to the GEMM kernels.
#[derive(Debug, Default, Clone, Copy)]
pub struct FaerInterceptor;

impl CpuKernelInterceptor for FaerInterceptor {
    fn try_execute(
        &self,
        layer: &CpuLayer,
        inputs: &[CpuTensor],
        scheduler: &dyn KernelScheduler,
        dst: &mut [f32],
    ) -> Option<BackendResult<()>> {
        // Quantized layers keep the reference path and its rounding.
        if layer.output.data_type != DataType::Float32
            || inputs
                .iter()
                .any(|input| input.info.data_type != DataType::Float32)
        {
            return None;
        }
        match &layer.kind {
            LayerKind::Convolution2d { descriptor, .. } => Some(
                expect_input(layer, inputs, 0)
                    .and_then(|input| ConvGemmKernel::new(layer, descriptor, input))
                    .and_then(|kernel| scheduler.schedule(&kernel, &ScheduleHints::default(), dst)),
            ),
            LayerKind::FullyConnected { descriptor, .. } => Some(
                expect_input(layer, inputs, 0)
                    .and_then(|input| FullyConnectedGemmKernel::new(layer, descriptor, input))
                    .and_then(|kernel| scheduler.schedule(&kernel, &ScheduleHints::default(), dst)),
            ),
            _ => None,
        }
    }
}

type FaerInnerBackend = GenericCpuBackend<FaerInterceptor>;

/// faer/rayon CPU backend. Ranked above the reference backend, with identical support.
pub struct FaerBackend {
    inner: FaerInnerBackend,
}

impl FaerBackend {
    pub fn new() -> Self {
        Self::with_threads(default_thread_count())
    }

    pub fn with_threads(threads: usize) -> Self {
        Self {
            inner: FaerInnerBackend::with_parts(
                FAER_ID,
                priority::VECTORIZED_CPU,
                FaerInterceptor,
                Arc::new(RayonScheduler::new(threads)),
            ),
        }
    }

    /// Caps the bytes this backend's allocator hands out.
    pub fn with_memory_capacity(self, bytes: usize) -> Self {
        Self {
            inner: self.inner.with_memory_capacity(bytes),
        }
    }
}

impl Default for FaerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for FaerBackend {
    fn id(&self) -> BackendId {
        self.inner.id()
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.inner.capabilities()
    }

    fn factory(&self) -> &dyn WorkloadFactory {
        self.inner.factory()
    }

    fn allocator(&self) -> Arc<dyn TensorAllocator> {
        self.inner.allocator()
    }

    fn scheduler(&self) -> Arc<SchedulerCell> {
        self.inner.scheduler()
    }
}

/// Register the faer backend with `registry`.
pub fn register_faer_backend(registry: &BackendRegistry) {
    registry.register(Arc::new(FaerBackend::new()));
}

#[graphrt::linkme::distributed_slice(graphrt::backend::registry::BACKEND_REGISTRARS)]
static REGISTER_FAER_BACKEND: fn(&BackendRegistry) = register_faer_backend;
