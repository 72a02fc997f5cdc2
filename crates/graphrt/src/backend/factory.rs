use super::{BackendError, BackendResult};
use crate::graph::LayerKind;
use crate::memory::TensorHandle;
use crate::tensor::TensorInfo;

/// Validated configuration of a layer, as presented to a backend for a support check.
#[derive(Debug, Clone, Copy)]
pub struct LayerQuery<'a> {
    pub name: &'a str,
    pub kind: &'a LayerKind,
    pub inputs: &'a [TensorInfo],
    pub outputs: &'a [TensorInfo],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Support {
    Supported,
    Unsupported(String),
}

impl Support {
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Support::Unsupported(reason.into())
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, Support::Supported)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Support::Supported => None,
            Support::Unsupported(reason) => Some(reason),
        }
    }
}

/// Everything a factory needs to build the workload of one layer.
#[derive(Debug, Clone)]
pub struct WorkloadDescriptor {
    pub name: String,
    pub kind: LayerKind,
    pub inputs: Vec<TensorHandle>,
    pub outputs: Vec<TensorHandle>,
}

impl WorkloadDescriptor {
    /// Fails with `Unsupported` unless the handle counts match `inputs` and `outputs`.
    pub fn expect_arity(&self, inputs: usize, outputs: usize) -> BackendResult<()> {
        if self.inputs.len() != inputs || self.outputs.len() != outputs {
            return Err(BackendError::unsupported(
                self.kind.layer_type().as_str(),
                format!(
                    "{}: expected {inputs} inputs and {outputs} outputs, got {} and {}",
                    self.name,
                    self.inputs.len(),
                    self.outputs.len()
                ),
            ));
        }
        Ok(())
    }
}

/// Executable unit bound to concrete tensor handles.
pub trait Workload: Send {
    fn name(&self) -> &str;
    fn execute(&mut self) -> BackendResult<()>;
}

/// Per-backend support oracle and workload constructor.
pub trait WorkloadFactory: Send + Sync {
    fn is_supported(&self, query: &LayerQuery<'_>) -> Support;

    fn create_workload(&self, descriptor: WorkloadDescriptor) -> BackendResult<Box<dyn Workload>>;
}

/// Byte-for-byte copy between two handles of equal size. Serves `MemCopy` and `Reshape`.
pub struct CopyWorkload {
    name: String,
    src: TensorHandle,
    dst: TensorHandle,
}

impl CopyWorkload {
    pub fn new(descriptor: WorkloadDescriptor) -> BackendResult<Self> {
        descriptor.expect_arity(1, 1)?;
        let WorkloadDescriptor {
            name,
            mut inputs,
            mut outputs,
            kind,
        } = descriptor;
        let (src, dst) = (inputs.remove(0), outputs.remove(0));
        if src.byte_len() != dst.byte_len() {
            return Err(BackendError::unsupported(
                kind.layer_type().as_str(),
                format!(
                    "{name}: source has {} bytes, destination {}",
                    src.byte_len(),
                    dst.byte_len()
                ),
            ));
        }
        Ok(Self { name, src, dst })
    }
}

impl Workload for CopyWorkload {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&mut self) -> BackendResult<()> {
        let bytes = self.src.to_bytes();
        self.dst.copy_from_bytes(&bytes)
    }
}
