use std::sync::{Arc, Mutex};

use graphrt::backend::{
    Backend, BackendCapabilities, BackendId, BackendResult, LayerQuery, SchedulerCell, Support,
    Workload, WorkloadDescriptor, WorkloadFactory,
};
use graphrt::graph::LayerKind;
use graphrt::memory::TensorAllocator;

/// Test-only backend that delegates to another one and records every workload it creates.
pub struct RecordingBackend {
    inner: Arc<dyn Backend>,
    factory: RecordingFactory,
}

struct RecordingFactory {
    inner: Arc<dyn Backend>,
    created: Mutex<Vec<(String, LayerKind)>>,
}

impl RecordingBackend {
    pub fn wrap(inner: Arc<dyn Backend>) -> Self {
        Self {
            factory: RecordingFactory {
                inner: Arc::clone(&inner),
                created: Mutex::new(Vec::new()),
            },
            inner,
        }
    }

    /// `(layer name, layer kind)` of every workload created so far, in creation order.
    pub fn created_workloads(&self) -> Vec<(String, LayerKind)> {
        self.factory
            .created
            .lock()
            .expect("backend mutex poisoned")
            .clone()
    }
}

impl WorkloadFactory for RecordingFactory {
    fn is_supported(&self, query: &LayerQuery<'_>) -> Support {
        self.inner.factory().is_supported(query)
    }

    fn create_workload(&self, descriptor: WorkloadDescriptor) -> BackendResult<Box<dyn Workload>> {
        let entry = (descriptor.name.clone(), descriptor.kind.clone());
        let workload = self.inner.factory().create_workload(descriptor)?;
        self.created
            .lock()
            .expect("backend mutex poisoned")
            .push(entry);
        Ok(workload)
    }
}

impl Backend for RecordingBackend {
    fn id(&self) -> BackendId {
        self.inner.id()
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.inner.capabilities()
    }

    fn factory(&self) -> &dyn WorkloadFactory {
        &self.factory
    }

    fn allocator(&self) -> Arc<dyn TensorAllocator> {
        self.inner.allocator()
    }

    fn scheduler(&self) -> Arc<SchedulerCell> {
        self.inner.scheduler()
    }
}
