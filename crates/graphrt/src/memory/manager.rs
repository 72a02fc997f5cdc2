use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use super::allocator::TensorAllocator;
use super::handle::{SharedBuffer, TensorHandle};
use super::plan::BufferPlan;
use crate::backend::{BackendError, BackendId};
use crate::error::{Error, Result};
use crate::graph::OutputSlotRef;

#[derive(Debug, Default)]
struct Pool {
    buffers: Vec<SharedBuffer>,
    in_use: BTreeMap<BackendId, usize>,
}

/// Owns the pooled buffers of one built graph and lends handles to workloads.
#[derive(Debug)]
pub struct MemoryManager {
    pool: Mutex<Pool>,
    handles: HashMap<OutputSlotRef, TensorHandle>,
    peak_bytes: usize,
}

impl MemoryManager {
    /// Allocates every buffer of `plan` through its backend's allocator.
    ///
    /// The effective limit per backend is the tighter of the allocator's capacity and
    /// `limit`; exceeding it fails with `OutOfMemory`.
    pub fn allocate(
        plan: &BufferPlan,
        allocator_of: impl Fn(BackendId) -> Option<Arc<dyn TensorAllocator>>,
        limit: Option<usize>,
    ) -> Result<Self> {
        let mut pool = Pool::default();

        for slot in &plan.slots {
            let allocator = allocator_of(slot.backend).ok_or_else(|| {
                Error::Config(format!("backend {} is not registered", slot.backend))
            })?;
            let cap = match (allocator.capacity(), limit) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => usize::MAX,
            };
            let in_use = pool.in_use.get(&slot.backend).copied().unwrap_or(0);
            if in_use.saturating_add(slot.size_class) > cap {
                return Err(Error::OutOfMemory {
                    backend: slot.backend,
                    requested: slot.size_class,
                    in_use,
                    limit: cap,
                });
            }
            let bytes = allocator.allocate(slot.size_class).map_err(|err| match err {
                BackendError::OutOfMemory { requested, limit } => Error::OutOfMemory {
                    backend: slot.backend,
                    requested,
                    in_use,
                    limit,
                },
                other => Error::WorkloadExecutionFailure {
                    layer: format!("buffer {}", slot.id),
                    backend: slot.backend,
                    source: other,
                },
            })?;
            pool.buffers.push(Arc::new(RwLock::new(bytes)));
            *pool.in_use.entry(slot.backend).or_default() += slot.size_class;
        }

        let handles = plan
            .buffers
            .iter()
            .map(|spec| {
                let handle = TensorHandle::new(
                    spec.info.clone(),
                    spec.backend,
                    Arc::clone(&pool.buffers[spec.buffer]),
                    spec.byte_len,
                );
                (spec.slot, handle)
            })
            .collect();

        let peak_bytes = pool.in_use.values().sum();
        tracing::debug!(
            buffers = pool.buffers.len(),
            tensors = plan.buffers.len(),
            peak_bytes,
            "memory pool allocated"
        );

        Ok(Self {
            pool: Mutex::new(pool),
            handles,
            peak_bytes,
        })
    }

    pub fn handle(&self, slot: OutputSlotRef) -> Option<&TensorHandle> {
        self.handles.get(&slot)
    }

    /// Bytes held by the pool across all backends.
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }

    pub fn bytes_for(&self, backend: BackendId) -> usize {
        let pool = self.pool.lock().expect("memory pool mutex poisoned");
        pool.in_use.get(&backend).copied().unwrap_or(0)
    }

    pub fn buffer_count(&self) -> usize {
        self.pool.lock().expect("memory pool mutex poisoned").buffers.len()
    }

    /// Zeroes every pooled buffer so the next run cannot observe stale data.
    pub fn reset(&self) {
        let pool = self.pool.lock().expect("memory pool mutex poisoned");
        for buffer in &pool.buffers {
            buffer
                .write()
                .expect("tensor buffer lock poisoned")
                .fill(0);
        }
    }
}
