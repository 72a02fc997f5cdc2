//! Enumerates the element types a tensor descriptor may carry.

use serde::{Deserialize, Serialize};

/// Logical element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    /// 16-bit IEEE-754 floating point.
    Float16,
    /// 32-bit IEEE-754 floating point.
    Float32,
    /// 8-bit unsigned values with an asymmetric scale/offset.
    QAsymmU8,
    /// 32-bit signed integer, used for quantized biases.
    Signed32,
    /// One byte per element, zero is false.
    Boolean,
}

impl DataType {
    /// Number of bytes per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::Float16 => 2,
            DataType::Float32 | DataType::Signed32 => 4,
            DataType::QAsymmU8 | DataType::Boolean => 1,
        }
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, DataType::QAsymmU8)
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float16 | DataType::Float32)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Float16 => "f16",
            DataType::Float32 => "f32",
            DataType::QAsymmU8 => "qasymm_u8",
            DataType::Signed32 => "si32",
            DataType::Boolean => "bool",
        }
    }
}
