use serde::{Deserialize, Serialize};

use super::{DataType, TensorShape};

/// Per-tensor affine quantization parameters: `real = scale * (q - offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizationInfo {
    pub scale: f32,
    pub offset: i32,
}

impl QuantizationInfo {
    pub fn new(scale: f32, offset: i32) -> Self {
        Self { scale, offset }
    }

    /// Rounds half away from zero and saturates to the `u8` range.
    pub fn quantize(&self, value: f32) -> u8 {
        let scaled = (value / self.scale).round() as i64 + i64::from(self.offset);
        scaled.clamp(0, 255) as u8
    }

    pub fn dequantize(&self, value: u8) -> f32 {
        self.scale * (i32::from(value) - self.offset) as f32
    }
}

impl Default for QuantizationInfo {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset: 0,
        }
    }
}

/// Shape, element type and optional quantization of one data edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub shape: TensorShape,
    pub data_type: DataType,
    pub quantization: Option<QuantizationInfo>,
}

impl TensorInfo {
    pub fn new(shape: TensorShape, data_type: DataType) -> Self {
        Self {
            shape,
            data_type,
            quantization: None,
        }
    }

    pub fn quantized(shape: TensorShape, scale: f32, offset: i32) -> Self {
        Self {
            shape,
            data_type: DataType::QAsymmU8,
            quantization: Some(QuantizationInfo::new(scale, offset)),
        }
    }

    /// Shorthand for a `Float32` descriptor with the given extents.
    ///
    /// Panics if `dims` is empty, like [`TensorShape::from_dims`].
    pub fn f32(dims: &[u32]) -> Self {
        Self::new(TensorShape::from_dims(dims), DataType::Float32)
    }

    pub fn num_elements(&self) -> Option<usize> {
        self.shape.num_elements()
    }

    /// Storage size in bytes, `None` on overflow.
    pub fn num_bytes(&self) -> Option<usize> {
        self.num_elements()?
            .checked_mul(self.data_type.size_in_bytes())
    }

    /// Same element type and quantization with different extents.
    pub fn with_shape(&self, shape: TensorShape) -> Self {
        Self {
            shape,
            data_type: self.data_type,
            quantization: self.quantization,
        }
    }

    /// Quantization parameters, defaulting to identity for unquantized tensors.
    pub fn quantization_or_default(&self) -> QuantizationInfo {
        self.quantization.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_rounds_half_away_from_zero_and_saturates() {
        let q = QuantizationInfo::new(1.0, 0);
        assert_eq!(q.quantize(3.5), 4);
        assert_eq!(q.quantize(2.49), 2);
        assert_eq!(q.quantize(-3.0), 0);
        assert_eq!(q.quantize(300.0), 255);

        let shifted = QuantizationInfo::new(0.5, 10);
        assert_eq!(shifted.quantize(1.0), 12);
        assert_eq!(shifted.dequantize(12), 1.0);
    }

    #[test]
    fn byte_size_follows_data_type() {
        let info = TensorInfo::quantized(TensorShape::from_dims(&[1, 2, 2, 1]), 1.0, 0);
        assert_eq!(info.num_bytes(), Some(4));
        assert_eq!(TensorInfo::f32(&[1, 2, 2, 1]).num_bytes(), Some(16));
    }
}
