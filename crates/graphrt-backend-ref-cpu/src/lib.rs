pub mod cpu;
pub mod kernels;

use std::sync::Arc;

use graphrt::backend::BackendRegistry;

pub use cpu::{
    reference_support, CpuBackend, CpuKernelInterceptor, CpuLayer, CpuTensor, CpuWorkloadFactory,
    GenericCpuBackend, NoopInterceptor, REF_CPU_ID,
};

/// Register the reference CPU backend with `registry`.
///
/// Called automatically for the global registry through [`BACKEND_REGISTRARS`], but can also
/// be called manually for a private registry.
///
/// [`BACKEND_REGISTRARS`]: graphrt::backend::BACKEND_REGISTRARS
pub fn register_cpu_backend(registry: &BackendRegistry) {
    registry.register(Arc::new(CpuBackend::new()));
}

#[graphrt::linkme::distributed_slice(graphrt::backend::registry::BACKEND_REGISTRARS)]
static REGISTER_CPU_BACKEND: fn(&BackendRegistry) = register_cpu_backend;
