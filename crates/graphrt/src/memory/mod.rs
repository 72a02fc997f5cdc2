//! Tensor storage: backend allocators, pooled handles and the lifetime-based planner.

mod allocator;
mod handle;
mod manager;
mod plan;

pub use allocator::{HostAllocator, TensorAllocator};
pub use handle::{SharedBuffer, TensorHandle};
pub use manager::MemoryManager;
pub use plan::{
    compute_live_ranges, plan_buffers, BufferPlan, BufferSlot, BufferSpec, BufferUsage,
    LifetimePlan, LiveRange, SlotLifetime,
};
