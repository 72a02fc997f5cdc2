//! Static capability table: arity and output-shape inference per layer type.

use super::layer::{LayerKind, LayerType, OutputShapeRounding};
use crate::error::{Error, Result};
use crate::tensor::TensorShape;

/// Pure shape inference; the error string describes why the inputs are unacceptable.
pub type InferFn = fn(&LayerKind, &[TensorShape]) -> std::result::Result<Vec<TensorShape>, String>;

pub struct LayerCapability {
    pub inputs: usize,
    pub outputs: usize,
    /// `None` for layers whose output descriptor must be supplied by the caller.
    pub infer: Option<InferFn>,
}

static INPUT: LayerCapability = LayerCapability {
    inputs: 0,
    outputs: 1,
    infer: None,
};
static OUTPUT: LayerCapability = LayerCapability {
    inputs: 1,
    outputs: 0,
    infer: Some(infer_none),
};
static CONSTANT: LayerCapability = LayerCapability {
    inputs: 0,
    outputs: 1,
    infer: Some(infer_constant),
};
static CONVOLUTION_2D: LayerCapability = LayerCapability {
    inputs: 1,
    outputs: 1,
    infer: Some(infer_convolution2d),
};
static FULLY_CONNECTED: LayerCapability = LayerCapability {
    inputs: 1,
    outputs: 1,
    infer: Some(infer_fully_connected),
};
static POOLING_2D: LayerCapability = LayerCapability {
    inputs: 1,
    outputs: 1,
    infer: Some(infer_pooling2d),
};
static ELEMENTWISE_UNARY: LayerCapability = LayerCapability {
    inputs: 1,
    outputs: 1,
    infer: Some(infer_identity),
};
static ELEMENTWISE_BINARY: LayerCapability = LayerCapability {
    inputs: 2,
    outputs: 1,
    infer: Some(infer_broadcast),
};
static RESHAPE: LayerCapability = LayerCapability {
    inputs: 1,
    outputs: 1,
    infer: Some(infer_reshape),
};

pub fn capability(layer_type: LayerType) -> &'static LayerCapability {
    match layer_type {
        LayerType::Input => &INPUT,
        LayerType::Output => &OUTPUT,
        LayerType::Constant => &CONSTANT,
        LayerType::Convolution2d => &CONVOLUTION_2D,
        LayerType::FullyConnected => &FULLY_CONNECTED,
        LayerType::Pooling2d => &POOLING_2D,
        LayerType::Activation | LayerType::Softmax | LayerType::MemCopy => &ELEMENTWISE_UNARY,
        LayerType::Multiplication | LayerType::Addition => &ELEMENTWISE_BINARY,
        LayerType::Reshape => &RESHAPE,
    }
}

/// Infers output shapes for `kind` given its input shapes.
///
/// Deterministic and side-effect free. Layers that cannot infer (graph inputs) yield
/// `GraphInvalid`; unacceptable inputs yield `ShapeMismatch`.
pub fn infer_output_shapes(kind: &LayerKind, inputs: &[TensorShape]) -> Result<Vec<TensorShape>> {
    let layer_type = kind.layer_type();
    let capability = capability(layer_type);
    if inputs.len() != capability.inputs {
        return Err(Error::graph_invalid(format!(
            "{layer_type} expects {} inputs, got {}",
            capability.inputs,
            inputs.len()
        )));
    }
    let infer = capability.infer.ok_or_else(|| {
        Error::graph_invalid(format!("{layer_type} output shape must be set explicitly"))
    })?;
    infer(kind, inputs).map_err(|detail| Error::shape_mismatch(layer_type.as_str(), detail))
}

/// Broadcast rule shared by binary elementwise layers: equal rank, and per dimension the
/// extents are equal or one of them is 1. The output takes the larger extent.
pub fn broadcast_shapes(
    lhs: &TensorShape,
    rhs: &TensorShape,
) -> std::result::Result<TensorShape, String> {
    if lhs.rank() != rhs.rank() {
        return Err(format!("cannot broadcast {lhs} with {rhs}: ranks differ"));
    }
    let mut dims = Vec::with_capacity(lhs.rank());
    for (axis, (&a, &b)) in lhs.dims().iter().zip(rhs.dims()).enumerate() {
        if a != b && a != 1 && b != 1 {
            return Err(format!(
                "cannot broadcast {lhs} with {rhs}: extents {a} and {b} differ on axis {axis}"
            ));
        }
        dims.push(a.max(b));
    }
    Ok(TensorShape::from_dims(&dims))
}

fn infer_none(_: &LayerKind, _: &[TensorShape]) -> std::result::Result<Vec<TensorShape>, String> {
    Ok(Vec::new())
}

fn infer_constant(
    kind: &LayerKind,
    _: &[TensorShape],
) -> std::result::Result<Vec<TensorShape>, String> {
    match kind {
        LayerKind::Constant { tensor } => Ok(vec![tensor.info().shape.clone()]),
        other => Err(unexpected(other)),
    }
}

fn infer_identity(
    _: &LayerKind,
    inputs: &[TensorShape],
) -> std::result::Result<Vec<TensorShape>, String> {
    Ok(vec![inputs[0].clone()])
}

fn infer_broadcast(
    _: &LayerKind,
    inputs: &[TensorShape],
) -> std::result::Result<Vec<TensorShape>, String> {
    broadcast_shapes(&inputs[0], &inputs[1]).map(|shape| vec![shape])
}

fn infer_reshape(
    kind: &LayerKind,
    inputs: &[TensorShape],
) -> std::result::Result<Vec<TensorShape>, String> {
    let LayerKind::Reshape { target } = kind else {
        return Err(unexpected(kind));
    };
    if target.num_elements() != inputs[0].num_elements() {
        return Err(format!(
            "cannot reshape {} into {target}: element counts differ",
            inputs[0]
        ));
    }
    Ok(vec![target.clone()])
}

fn infer_convolution2d(
    kind: &LayerKind,
    inputs: &[TensorShape],
) -> std::result::Result<Vec<TensorShape>, String> {
    let LayerKind::Convolution2d {
        descriptor,
        weights,
        ..
    } = kind
    else {
        return Err(unexpected(kind));
    };
    let input = &inputs[0];
    if input.rank() != 4 {
        return Err(format!("convolution input must be NHWC, got {input}"));
    }
    let weights = &weights.info().shape;
    if weights.rank() != 4 {
        return Err(format!("convolution weights must be rank 4, got {weights}"));
    }
    if weights[3] != input[3] {
        return Err(format!(
            "weights {weights} expect {} input channels, input {input} has {}",
            weights[3], input[3]
        ));
    }
    let out_h = window_extent(
        input[1],
        descriptor.pad_top,
        descriptor.pad_bottom,
        weights[1],
        descriptor.stride_y,
        OutputShapeRounding::Floor,
    )?;
    let out_w = window_extent(
        input[2],
        descriptor.pad_left,
        descriptor.pad_right,
        weights[2],
        descriptor.stride_x,
        OutputShapeRounding::Floor,
    )?;
    Ok(vec![TensorShape::from_dims(&[input[0], out_h, out_w, weights[0]])])
}

fn infer_fully_connected(
    kind: &LayerKind,
    inputs: &[TensorShape],
) -> std::result::Result<Vec<TensorShape>, String> {
    let LayerKind::FullyConnected {
        descriptor,
        weights,
        ..
    } = kind
    else {
        return Err(unexpected(kind));
    };
    let input = &inputs[0];
    if input.rank() < 2 {
        return Err(format!("fully connected input must be at least rank 2, got {input}"));
    }
    let batch = input[0];
    let features: u64 = input.dims()[1..].iter().map(|&d| u64::from(d)).product();
    let weights = &weights.info().shape;
    if weights.rank() != 2 {
        return Err(format!("fully connected weights must be rank 2, got {weights}"));
    }
    let (w_in, w_out) = if descriptor.transpose_weights {
        (weights[1], weights[0])
    } else {
        (weights[0], weights[1])
    };
    if u64::from(w_in) != features {
        return Err(format!(
            "weights {weights} expect {w_in} input features, input {input} has {features}"
        ));
    }
    Ok(vec![TensorShape::from_dims(&[batch, w_out])])
}

fn infer_pooling2d(
    kind: &LayerKind,
    inputs: &[TensorShape],
) -> std::result::Result<Vec<TensorShape>, String> {
    let LayerKind::Pooling2d { descriptor } = kind else {
        return Err(unexpected(kind));
    };
    let input = &inputs[0];
    if input.rank() != 4 {
        return Err(format!("pooling input must be NHWC, got {input}"));
    }
    let out_h = window_extent(
        input[1],
        descriptor.pad_top,
        descriptor.pad_bottom,
        descriptor.pool_height,
        descriptor.stride_y,
        descriptor.rounding,
    )?;
    let out_w = window_extent(
        input[2],
        descriptor.pad_left,
        descriptor.pad_right,
        descriptor.pool_width,
        descriptor.stride_x,
        descriptor.rounding,
    )?;
    Ok(vec![TensorShape::from_dims(&[input[0], out_h, out_w, input[3]])])
}

/// Number of window positions along one axis.
fn window_extent(
    size: u32,
    pad_before: u32,
    pad_after: u32,
    window: u32,
    stride: u32,
    rounding: OutputShapeRounding,
) -> std::result::Result<u32, String> {
    if stride == 0 {
        return Err("stride must be positive".to_string());
    }
    let padded = size
        .checked_add(pad_before)
        .and_then(|extent| extent.checked_add(pad_after))
        .ok_or_else(|| {
            format!("padding {pad_before} + {pad_after} overflows extent {size}")
        })?;
    if window == 0 || padded < window {
        return Err(format!(
            "window of {window} does not fit padded extent {padded}"
        ));
    }
    let span = padded - window;
    let steps = match rounding {
        OutputShapeRounding::Floor => span / stride,
        OutputShapeRounding::Ceiling => span.div_ceil(stride),
    };
    Ok(steps + 1)
}

fn unexpected(kind: &LayerKind) -> String {
    format!("unexpected parameters for {}", kind.layer_type())
}
