//! Host-side tensor payloads: constants owned by layers and caller input/output buffers.

use std::sync::Arc;

use super::{DataType, TensorInfo, TensorShape};
use crate::error::{Error, Result};

/// Immutable constant payload (weights, biases, `Constant` layers).
#[derive(Debug, Clone, PartialEq)]
pub struct ConstTensor {
    info: TensorInfo,
    bytes: Arc<[u8]>,
}

impl ConstTensor {
    /// Wraps raw little-endian bytes, validating the length against the descriptor.
    pub fn from_bytes(info: TensorInfo, bytes: impl Into<Arc<[u8]>>) -> Result<Self> {
        let bytes = bytes.into();
        check_payload_len(&info, bytes.len())?;
        Ok(Self { info, bytes })
    }

    pub fn from_f32(shape: TensorShape, values: &[f32]) -> Result<Self> {
        Self::from_bytes(
            TensorInfo::new(shape, DataType::Float32),
            f32_to_bytes(values),
        )
    }

    pub fn from_i32(shape: TensorShape, values: &[i32]) -> Result<Self> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(TensorInfo::new(shape, DataType::Signed32), bytes)
    }

    pub fn from_u8(info: TensorInfo, values: &[u8]) -> Result<Self> {
        Self::from_bytes(info, values.to_vec())
    }

    pub fn info(&self) -> &TensorInfo {
        &self.info
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Values converted to `f32`, dequantizing when needed.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        decode_to_f32(&self.info, &self.bytes)
    }
}

/// Caller-owned tensor bound to an input or read back from an output.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    info: TensorInfo,
    data: Vec<u8>,
}

impl HostTensor {
    pub fn from_bytes(info: TensorInfo, data: Vec<u8>) -> Result<Self> {
        check_payload_len(&info, data.len())?;
        Ok(Self { info, data })
    }

    pub fn from_f32(shape: TensorShape, values: &[f32]) -> Result<Self> {
        Self::from_bytes(
            TensorInfo::new(shape, DataType::Float32),
            f32_to_bytes(values),
        )
    }

    /// Quantized `u8` payload with identity quantization unless `info` says otherwise.
    pub fn from_u8(info: TensorInfo, values: &[u8]) -> Result<Self> {
        Self::from_bytes(info, values.to_vec())
    }

    pub fn info(&self) -> &TensorInfo {
        &self.info
    }

    pub fn data_type(&self) -> DataType {
        self.info.data_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Raw elements of a one-byte element type.
    pub fn as_u8(&self) -> Option<&[u8]> {
        match self.info.data_type {
            DataType::QAsymmU8 | DataType::Boolean => Some(&self.data),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Values converted to `f32`, dequantizing when needed.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        decode_to_f32(&self.info, &self.data)
    }
}

fn check_payload_len(info: &TensorInfo, len: usize) -> Result<()> {
    let expected = info
        .num_bytes()
        .ok_or_else(|| Error::graph_invalid(format!("tensor {} is too large", info.shape)))?;
    if expected != len {
        return Err(Error::graph_invalid(format!(
            "tensor payload of {len} bytes does not match {} {:?} ({expected} bytes)",
            info.shape, info.data_type
        )));
    }
    Ok(())
}

/// Decodes a little-endian payload into `f32` values.
///
/// Quantized payloads are dequantized with the descriptor's parameters; `Float16` has no
/// host decoding and yields `None`.
pub fn decode_to_f32(info: &TensorInfo, bytes: &[u8]) -> Option<Vec<f32>> {
    match info.data_type {
        DataType::Float32 => Some(bytes_to_f32(bytes)),
        DataType::QAsymmU8 => {
            let q = info.quantization_or_default();
            Some(bytes.iter().map(|&b| q.dequantize(b)).collect())
        }
        DataType::Signed32 => {
            let values = bytes_to_i32(bytes).into_iter();
            Some(match info.quantization {
                Some(q) => values.map(|v| q.scale * (v - q.offset) as f32).collect(),
                None => values.map(|v| v as f32).collect(),
            })
        }
        DataType::Boolean => Some(bytes.iter().map(|&b| if b != 0 { 1.0 } else { 0.0 }).collect()),
        DataType::Float16 => None,
    }
}

/// Encodes `f32` values into `dst` using the descriptor's element type.
///
/// Returns `false` when the element type has no host encoding or `dst` has the wrong size.
pub fn encode_from_f32(info: &TensorInfo, values: &[f32], dst: &mut [u8]) -> bool {
    let elem = info.data_type.size_in_bytes();
    if dst.len() != values.len() * elem {
        return false;
    }
    match info.data_type {
        DataType::Float32 => {
            for (chunk, value) in dst.chunks_exact_mut(4).zip(values) {
                chunk.copy_from_slice(&value.to_le_bytes());
            }
            true
        }
        DataType::QAsymmU8 => {
            let q = info.quantization_or_default();
            for (slot, value) in dst.iter_mut().zip(values) {
                *slot = q.quantize(*value);
            }
            true
        }
        DataType::Signed32 => {
            for (chunk, value) in dst.chunks_exact_mut(4).zip(values) {
                chunk.copy_from_slice(&(value.round() as i32).to_le_bytes());
            }
            true
        }
        DataType::Boolean => {
            for (slot, value) in dst.iter_mut().zip(values) {
                *slot = u8::from(*value != 0.0);
            }
            true
        }
        DataType::Float16 => false,
    }
}

pub fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub fn bytes_to_i32(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub fn f32_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}
