//! Execution engine: builds an optimized, memory-planned graph and runs it.

mod engine;

pub use engine::{EngineState, ExecutionEngine};
