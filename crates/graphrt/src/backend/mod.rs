//! Backend abstraction: identity, capabilities, workload factories and kernel schedulers.
//!
//! A backend bundles four things the core needs from it:
//! - a [`WorkloadFactory`] that answers support queries and builds workloads,
//! - a [`TensorAllocator`] used by the memory manager for its buffers,
//! - a [`SchedulerCell`] holding the kernel scheduler its workloads dispatch through,
//! - static [`BackendCapabilities`] (memory domain and selection priority).
//!
//! Backends are registered with a [`BackendRegistry`], either explicitly or through
//! [`BACKEND_REGISTRARS`] from their own crate.

mod factory;
pub mod registry;
pub mod scheduler;

use std::fmt;
use std::sync::Arc;

use crate::memory::TensorAllocator;
use crate::tensor::DataType;

pub use factory::{
    CopyWorkload, LayerQuery, Support, Workload, WorkloadDescriptor, WorkloadFactory,
};
pub use registry::{BackendRegistry, BACKEND_REGISTRARS};
pub use scheduler::{
    check_destination, InterceptGuard, InterceptorScheduler, Kernel, KernelMeasurement,
    KernelMeasurements, KernelScheduler, ScheduleHints, SchedulerCell, SerialScheduler,
    ThreadInfo, WorkloadFn, WORKLOAD_LABEL,
};

/// Stable backend identifier (e.g. `"ref-cpu"`, `"faer"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(&'static str);

impl BackendId {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Address space a backend's tensor handles live in.
///
/// Producers and consumers in different domains need an explicit copy between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryDomain {
    Host,
    Device(&'static str),
}

/// Selection priority bands. Higher values are tried first.
pub mod priority {
    pub const ACCELERATOR: u32 = 300;
    pub const VECTORIZED_CPU: u32 = 200;
    pub const REFERENCE: u32 = 100;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub memory_domain: MemoryDomain,
    pub priority: u32,
}

/// A hardware backend able to run workloads.
pub trait Backend: Send + Sync {
    fn id(&self) -> BackendId;

    fn capabilities(&self) -> BackendCapabilities;

    fn factory(&self) -> &dyn WorkloadFactory;

    fn allocator(&self) -> Arc<dyn TensorAllocator>;

    /// Scheduler its workloads dispatch kernels through. Swappable while profiling.
    fn scheduler(&self) -> Arc<SchedulerCell>;
}

/// Errors reported by backend factories, workloads, schedulers and allocators.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    Unsupported { op: &'static str, reason: String },
    Execution { message: String },
    TypeMismatch { expected: DataType, actual: DataType },
    OutOfMemory { requested: usize, limit: usize },
}

impl BackendError {
    pub fn unsupported(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unsupported {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unsupported { op, reason } => {
                write!(f, "{op} is not supported: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
            BackendError::TypeMismatch { expected, actual } => {
                write!(f, "expected {expected:?} tensor, got {actual:?}")
            }
            BackendError::OutOfMemory { requested, limit } => {
                write!(f, "cannot allocate {requested} bytes (limit {limit})")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;
