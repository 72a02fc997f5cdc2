use crate::backend::{BackendError, BackendResult};

/// Source of raw storage for one backend's tensor handles.
pub trait TensorAllocator: Send + Sync {
    /// Buffers are sized in multiples of this many bytes.
    fn alignment(&self) -> usize {
        64
    }

    /// Upper bound on the bytes this allocator hands out, if any.
    fn capacity(&self) -> Option<usize> {
        None
    }

    /// Returns a zero-filled buffer of exactly `size` bytes.
    fn allocate(&self, size: usize) -> BackendResult<Vec<u8>>;
}

/// Heap allocator used by host-memory backends.
#[derive(Debug, Clone, Copy)]
pub struct HostAllocator {
    alignment: usize,
    capacity: Option<usize>,
}

impl HostAllocator {
    pub fn new(alignment: usize) -> Self {
        Self {
            alignment: alignment.max(1),
            capacity: None,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new(64)
    }
}

impl TensorAllocator for HostAllocator {
    fn alignment(&self) -> usize {
        self.alignment
    }

    fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn allocate(&self, size: usize) -> BackendResult<Vec<u8>> {
        let limit = self.capacity.unwrap_or(usize::MAX);
        if size > limit {
            return Err(BackendError::OutOfMemory {
                requested: size,
                limit,
            });
        }
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(size)
            .map_err(|_| BackendError::OutOfMemory {
                requested: size,
                limit,
            })?;
        buffer.resize(size, 0);
        Ok(buffer)
    }
}
