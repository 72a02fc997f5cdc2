//! Heterogeneous-backend execution engine for pre-trained inference graphs.
//!
//! A [`graph::NetworkBuilder`] produces a backend-agnostic [`graph::Graph`]. The
//! [`runtime::ExecutionEngine`] optimizes it (validation, fusion, backend assignment, copy
//! insertion, lifetime planning), maps every tensor onto pooled memory and runs one
//! workload per layer in topological order. Backends plug in through
//! [`backend::Backend`] and register with a [`backend::BackendRegistry`].

pub use linkme;

pub mod backend;
pub mod config;
mod env;
pub mod error;
pub mod graph;
pub mod memory;
pub mod optimizer;
pub mod profiling;
pub mod runtime;
pub mod tensor;

pub use backend::{Backend, BackendError, BackendId, BackendRegistry, BackendResult};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use graph::{Graph, NetworkBuilder};
pub use runtime::{EngineState, ExecutionEngine};
pub use tensor::{DataType, HostTensor, TensorInfo, TensorShape};
