//! Error taxonomy shared by the graph, optimizer, memory manager and engine.

use thiserror::Error;

use crate::backend::{BackendError, BackendId};
use crate::tensor::DataType;

/// Errors surfaced by the core.
///
/// Optimization-time failures are returned synchronously from the call that detected them;
/// execution-time failures abort the current run only.
#[derive(Debug, Error)]
pub enum Error {
    /// An inferred output shape disagrees with the descriptor already set on the slot, or
    /// the input shapes cannot be combined at all.
    #[error("{layer}: shape mismatch: {detail}")]
    ShapeMismatch { layer: String, detail: String },

    /// Structural violation: cycle, unconnected slot, arity mismatch, bad parameters.
    #[error("invalid graph: {0}")]
    GraphInvalid(String),

    /// No registered backend accepts the layer's validated configuration.
    #[error("no backend supports layer {layer} ({layer_type}): {}", reasons.join("; "))]
    BackendUnsupported {
        layer: String,
        layer_type: &'static str,
        reasons: Vec<String>,
    },

    /// Backend allocator refused a buffer.
    #[error("out of memory on backend {backend}: requested {requested} bytes (in use {in_use}, limit {limit})")]
    OutOfMemory {
        backend: BackendId,
        requested: usize,
        in_use: usize,
        limit: usize,
    },

    /// A workload reported a failure while running.
    #[error("workload for layer {layer} on backend {backend} failed: {source}")]
    WorkloadExecutionFailure {
        layer: String,
        backend: BackendId,
        #[source]
        source: BackendError,
    },

    /// Caller supplied data whose type does not match the validated descriptor.
    #[error("binding {binding}: expected {expected:?} data, got {actual:?}")]
    TypeMismatch {
        binding: u32,
        expected: DataType,
        actual: DataType,
    },

    /// Caller supplied data whose size or shape does not match the validated descriptor.
    #[error("binding {binding}: {detail}")]
    BindingMismatch { binding: u32, detail: String },

    /// An engine operation was requested in a state that does not permit it.
    #[error("engine is {state}, cannot {operation}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },

    /// Malformed configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn graph_invalid(message: impl Into<String>) -> Self {
        Error::GraphInvalid(message.into())
    }

    pub fn shape_mismatch(layer: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::ShapeMismatch {
            layer: layer.into(),
            detail: detail.into(),
        }
    }
}

/// Convenience alias for results returned by the core.
pub type Result<T> = std::result::Result<T, Error>;
