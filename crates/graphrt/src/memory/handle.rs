use std::sync::{Arc, RwLock};

use crate::backend::{BackendError, BackendId, BackendResult};
use crate::tensor::{decode_to_f32, encode_from_f32, TensorInfo};

/// Pooled allocation shared by every handle the planner mapped onto it.
pub type SharedBuffer = Arc<RwLock<Vec<u8>>>;

/// Backend-specific binding of one output slot to pooled storage.
///
/// The underlying buffer may be larger than the tensor (it is sized to a size class), so
/// every accessor works on the first `byte_len` bytes only.
#[derive(Debug, Clone)]
pub struct TensorHandle {
    info: TensorInfo,
    backend: BackendId,
    buffer: SharedBuffer,
    byte_len: usize,
}

impl TensorHandle {
    pub fn new(info: TensorInfo, backend: BackendId, buffer: SharedBuffer, byte_len: usize) -> Self {
        Self {
            info,
            backend,
            buffer,
            byte_len,
        }
    }

    pub fn info(&self) -> &TensorInfo {
        &self.info
    }

    pub fn backend(&self) -> BackendId {
        self.backend
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Whether two handles alias the same pooled buffer.
    pub fn shares_buffer(&self, other: &TensorHandle) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.buffer.read().expect("tensor buffer lock poisoned");
        f(&guard[..self.byte_len])
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.buffer.write().expect("tensor buffer lock poisoned");
        f(&mut guard[..self.byte_len])
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.read(|bytes| bytes.to_vec())
    }

    pub fn copy_from_bytes(&self, src: &[u8]) -> BackendResult<()> {
        if src.len() != self.byte_len {
            return Err(BackendError::execution(format!(
                "cannot copy {} bytes into a {} byte tensor",
                src.len(),
                self.byte_len
            )));
        }
        self.write(|dst| dst.copy_from_slice(src));
        Ok(())
    }

    /// Element values as `f32`, dequantized when the tensor is quantized.
    pub fn to_f32_vec(&self) -> BackendResult<Vec<f32>> {
        self.read(|bytes| decode_to_f32(&self.info, bytes))
            .ok_or_else(|| {
                BackendError::unsupported(
                    "read",
                    format!("{:?} tensors have no host representation", self.info.data_type),
                )
            })
    }

    /// Stores `f32` values, quantizing when the tensor is quantized.
    pub fn write_f32(&self, values: &[f32]) -> BackendResult<()> {
        let written = self.write(|bytes| encode_from_f32(&self.info, values, bytes));
        if !written {
            return Err(BackendError::execution(format!(
                "cannot store {} values into {} {:?} tensor",
                values.len(),
                self.info.shape,
                self.info.data_type
            )));
        }
        Ok(())
    }

    pub fn zero(&self) {
        self.write(|bytes| bytes.fill(0));
    }
}
