//! Tensor metadata attached to every data edge, plus host-side payloads.

mod dtype;
mod host;
mod info;
mod shape;

pub use dtype::DataType;
pub use host::{
    bytes_to_f32, bytes_to_i32, decode_to_f32, encode_from_f32, f32_to_bytes, ConstTensor,
    HostTensor,
};
pub use info::{QuantizationInfo, TensorInfo};
pub use shape::TensorShape;
