//! Portable scalar kernels for every compute layer.
//!
//! Each kernel produces its output row by row so a scheduler may split rows across
//! workers. Values are `f32`; quantized tensors are dequantized on the way in and
//! requantized by the workload on the way out.

use std::ops::Range;

use graphrt::backend::{BackendError, BackendResult, Kernel, KernelScheduler, ScheduleHints};
use graphrt::graph::{
    ActivationFunction, Convolution2dDescriptor, FullyConnectedDescriptor, LayerKind,
    PaddingMethod, Pooling2dDescriptor, PoolingAlgorithm,
};

use crate::cpu::{CpuLayer, CpuTensor};

/// Runs the reference kernel of `layer` through `scheduler`, writing into `dst`.
pub fn dispatch(
    layer: &CpuLayer,
    inputs: &[CpuTensor],
    scheduler: &dyn KernelScheduler,
    dst: &mut [f32],
) -> BackendResult<()> {
    let hints = ScheduleHints::default();
    match &layer.kind {
        LayerKind::Convolution2d { descriptor, .. } => {
            let kernel = Conv2dKernel::new(layer, descriptor, expect_input(layer, inputs, 0)?)?;
            scheduler.schedule(&kernel, &hints, dst)
        }
        LayerKind::FullyConnected { descriptor, .. } => {
            let kernel =
                FullyConnectedKernel::new(layer, descriptor, expect_input(layer, inputs, 0)?)?;
            scheduler.schedule(&kernel, &hints, dst)
        }
        LayerKind::Pooling2d { descriptor } => {
            let kernel = Pool2dKernel::new(layer, descriptor, expect_input(layer, inputs, 0)?)?;
            scheduler.schedule(&kernel, &hints, dst)
        }
        LayerKind::Activation { function } => {
            let kernel = ActivationKernel {
                function: *function,
                input: expect_input(layer, inputs, 0)?,
                row_len: last_extent(&layer.output_dims),
            };
            scheduler.schedule(&kernel, &hints, dst)
        }
        LayerKind::Addition | LayerKind::Multiplication => {
            let op = if matches!(layer.kind, LayerKind::Addition) {
                BinaryOp::Add
            } else {
                BinaryOp::Mul
            };
            let kernel = BroadcastKernel::new(
                op,
                expect_input(layer, inputs, 0)?,
                expect_input(layer, inputs, 1)?,
                &layer.output_dims,
            )?;
            scheduler.schedule(&kernel, &hints, dst)
        }
        LayerKind::Softmax { beta } => {
            let kernel = SoftmaxKernel {
                beta: *beta,
                input: expect_input(layer, inputs, 0)?,
                row_len: last_extent(&layer.output_dims),
            };
            scheduler.schedule(&kernel, &hints, dst)
        }
        other => Err(BackendError::unsupported(
            other.layer_type().as_str(),
            format!("{}: no reference kernel", layer.name),
        )),
    }
}

pub fn expect_input<'a>(
    layer: &CpuLayer,
    inputs: &'a [CpuTensor],
    index: usize,
) -> BackendResult<&'a CpuTensor> {
    inputs.get(index).ok_or_else(|| {
        BackendError::execution(format!(
            "{}: expected input {index}, got {} inputs",
            layer.name,
            inputs.len()
        ))
    })
}

fn last_extent(dims: &[usize]) -> usize {
    dims.last().copied().unwrap_or(1).max(1)
}

pub fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

pub fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

/// Strides of `dims` read as `out_dims`: broadcast axes (extent 1) get stride zero.
pub fn broadcast_strides(dims: &[usize], out_dims: &[usize]) -> BackendResult<Vec<usize>> {
    if dims.len() != out_dims.len() {
        return Err(BackendError::execution(format!(
            "cannot broadcast rank {} into rank {}",
            dims.len(),
            out_dims.len()
        )));
    }
    let strides = compute_strides(dims);
    dims.iter()
        .zip(out_dims)
        .zip(strides)
        .map(|((&dim, &out), stride)| match dim {
            d if d == out => Ok(stride),
            1 => Ok(0),
            _ => Err(BackendError::execution(format!(
                "extent {dim} does not broadcast to {out}"
            ))),
        })
        .collect()
}

/// Adds `bias` to every row and applies `activation`, in place.
pub fn finish_rows(
    dst: &mut [f32],
    row_len: usize,
    bias: Option<&[f32]>,
    activation: Option<ActivationFunction>,
) {
    if bias.is_none() && activation.is_none() {
        return;
    }
    for row in dst.chunks_exact_mut(row_len) {
        if let Some(bias) = bias {
            for (value, b) in row.iter_mut().zip(bias) {
                *value += *b;
            }
        }
        if let Some(function) = activation {
            for value in row.iter_mut() {
                *value = function.apply(*value);
            }
        }
    }
}

/// Resolved NHWC convolution extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dGeometry {
    pub batch: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub in_c: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub out_c: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_y: usize,
    pub stride_x: usize,
    pub pad_top: usize,
    pub pad_left: usize,
}

impl Conv2dGeometry {
    pub fn new(
        descriptor: &Convolution2dDescriptor,
        input_dims: &[usize],
        weight_dims: &[usize],
        output_dims: &[usize],
    ) -> BackendResult<Self> {
        let [batch, in_h, in_w, in_c] = rank4(input_dims, "input")?;
        let [out_c, kernel_h, kernel_w, w_in_c] = rank4(weight_dims, "weights")?;
        let [out_n, out_h, out_w, o_c] = rank4(output_dims, "output")?;
        if w_in_c != in_c || o_c != out_c || out_n != batch {
            return Err(BackendError::execution(format!(
                "convolution extents disagree: input {input_dims:?}, weights {weight_dims:?}, output {output_dims:?}"
            )));
        }
        Ok(Self {
            batch,
            in_h,
            in_w,
            in_c,
            out_h,
            out_w,
            out_c,
            kernel_h,
            kernel_w,
            stride_y: descriptor.stride_y as usize,
            stride_x: descriptor.stride_x as usize,
            pad_top: descriptor.pad_top as usize,
            pad_left: descriptor.pad_left as usize,
        })
    }

    pub fn output_pixels(&self) -> usize {
        self.batch * self.out_h * self.out_w
    }

    /// Elements of one unrolled receptive field, `kh * kw * in_c`.
    pub fn patch_len(&self) -> usize {
        self.kernel_h * self.kernel_w * self.in_c
    }

    /// Offset of channel zero of tap `(ky, kx)` for output `pixel`, `None` inside padding.
    pub fn input_offset(&self, pixel: usize, ky: usize, kx: usize) -> Option<usize> {
        let ow = pixel % self.out_w;
        let oh = (pixel / self.out_w) % self.out_h;
        let n = pixel / (self.out_w * self.out_h);
        let y = (oh * self.stride_y + ky).checked_sub(self.pad_top)?;
        let x = (ow * self.stride_x + kx).checked_sub(self.pad_left)?;
        if y >= self.in_h || x >= self.in_w {
            return None;
        }
        Some(((n * self.in_h + y) * self.in_w + x) * self.in_c)
    }

    /// Writes the receptive field of `pixel` into `dst`, zero-filling padded taps.
    pub fn unroll_patch(&self, input: &[f32], pixel: usize, dst: &mut [f32]) {
        let in_c = self.in_c;
        for ky in 0..self.kernel_h {
            for kx in 0..self.kernel_w {
                let at = (ky * self.kernel_w + kx) * in_c;
                let target = &mut dst[at..at + in_c];
                match self.input_offset(pixel, ky, kx) {
                    Some(base) => target.copy_from_slice(&input[base..base + in_c]),
                    None => target.fill(0.0),
                }
            }
        }
    }
}

fn rank4(dims: &[usize], what: &str) -> BackendResult<[usize; 4]> {
    <[usize; 4]>::try_from(dims).map_err(|_| {
        BackendError::execution(format!("convolution {what} must be rank 4, got {dims:?}"))
    })
}

/// Direct NHWC convolution; one row per output pixel, `out_c` values per row.
pub struct Conv2dKernel<'a> {
    geometry: Conv2dGeometry,
    input: &'a [f32],
    weights: &'a [f32],
    bias: Option<&'a [f32]>,
    activation: Option<ActivationFunction>,
}

impl<'a> Conv2dKernel<'a> {
    pub fn new(
        layer: &'a CpuLayer,
        descriptor: &Convolution2dDescriptor,
        input: &'a CpuTensor,
    ) -> BackendResult<Self> {
        let weights = layer.expect_weights()?;
        let geometry =
            Conv2dGeometry::new(descriptor, &input.dims, &weights.dims, &layer.output_dims)?;
        Ok(Self {
            geometry,
            input: &input.data,
            weights: &weights.data,
            bias: layer.bias.as_deref(),
            activation: descriptor.fused_activation,
        })
    }
}

impl Kernel for Conv2dKernel<'_> {
    fn name(&self) -> &str {
        "RefConvolution2d"
    }

    fn rows(&self) -> usize {
        self.geometry.output_pixels()
    }

    fn row_len(&self) -> usize {
        self.geometry.out_c
    }

    fn run(&self, rows: Range<usize>, dst: &mut [f32]) -> BackendResult<()> {
        let g = &self.geometry;
        for (pixel, row) in rows.zip(dst.chunks_exact_mut(g.out_c)) {
            for (oc, out) in row.iter_mut().enumerate() {
                let mut acc = self.bias.map_or(0.0, |bias| bias[oc]);
                for ky in 0..g.kernel_h {
                    for kx in 0..g.kernel_w {
                        let Some(base) = g.input_offset(pixel, ky, kx) else {
                            continue;
                        };
                        let w_base = ((oc * g.kernel_h + ky) * g.kernel_w + kx) * g.in_c;
                        let taps = &self.input[base..base + g.in_c];
                        let weights = &self.weights[w_base..w_base + g.in_c];
                        acc += taps.iter().zip(weights).map(|(x, w)| x * w).sum::<f32>();
                    }
                }
                *out = self.activation.map_or(acc, |function| function.apply(acc));
            }
        }
        Ok(())
    }
}

/// Resolved fully-connected extents: `[batch, in_features] x W -> [batch, out_features]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullyConnectedGeometry {
    pub batch: usize,
    pub in_features: usize,
    pub out_features: usize,
    pub transpose_weights: bool,
}

impl FullyConnectedGeometry {
    pub fn new(
        descriptor: &FullyConnectedDescriptor,
        input_len: usize,
        weight_dims: &[usize],
    ) -> BackendResult<Self> {
        let [rows, cols] = <[usize; 2]>::try_from(weight_dims).map_err(|_| {
            BackendError::execution(format!(
                "fully connected weights must be rank 2, got {weight_dims:?}"
            ))
        })?;
        let (in_features, out_features) = if descriptor.transpose_weights {
            (cols, rows)
        } else {
            (rows, cols)
        };
        if in_features == 0 || input_len % in_features != 0 {
            return Err(BackendError::execution(format!(
                "{input_len} input values do not flatten to rows of {in_features}"
            )));
        }
        Ok(Self {
            batch: input_len / in_features,
            in_features,
            out_features,
            transpose_weights: descriptor.transpose_weights,
        })
    }

    /// Weight applied to input feature `i` for output feature `o`.
    pub fn weight_index(&self, i: usize, o: usize) -> usize {
        if self.transpose_weights {
            o * self.in_features + i
        } else {
            i * self.out_features + o
        }
    }
}

pub struct FullyConnectedKernel<'a> {
    geometry: FullyConnectedGeometry,
    input: &'a [f32],
    weights: &'a [f32],
    bias: Option<&'a [f32]>,
    activation: Option<ActivationFunction>,
}

impl<'a> FullyConnectedKernel<'a> {
    pub fn new(
        layer: &'a CpuLayer,
        descriptor: &FullyConnectedDescriptor,
        input: &'a CpuTensor,
    ) -> BackendResult<Self> {
        let weights = layer.expect_weights()?;
        let geometry = FullyConnectedGeometry::new(descriptor, input.len(), &weights.dims)?;
        Ok(Self {
            geometry,
            input: &input.data,
            weights: &weights.data,
            bias: layer.bias.as_deref(),
            activation: descriptor.fused_activation,
        })
    }
}

impl Kernel for FullyConnectedKernel<'_> {
    fn name(&self) -> &str {
        "RefFullyConnected"
    }

    fn rows(&self) -> usize {
        self.geometry.batch
    }

    fn row_len(&self) -> usize {
        self.geometry.out_features
    }

    fn run(&self, rows: Range<usize>, dst: &mut [f32]) -> BackendResult<()> {
        let g = &self.geometry;
        for (b, row) in rows.zip(dst.chunks_exact_mut(g.out_features)) {
            let x = &self.input[b * g.in_features..(b + 1) * g.in_features];
            for (o, out) in row.iter_mut().enumerate() {
                let mut acc = self.bias.map_or(0.0, |bias| bias[o]);
                for (i, value) in x.iter().enumerate() {
                    acc += value * self.weights[g.weight_index(i, o)];
                }
                *out = self.activation.map_or(acc, |function| function.apply(acc));
            }
        }
        Ok(())
    }
}

/// NHWC pooling; one row per output pixel, one value per channel.
pub struct Pool2dKernel<'a> {
    descriptor: Pooling2dDescriptor,
    input: &'a [f32],
    in_dims: [usize; 4],
    out_dims: [usize; 4],
}

impl<'a> Pool2dKernel<'a> {
    pub fn new(
        layer: &CpuLayer,
        descriptor: &Pooling2dDescriptor,
        input: &'a CpuTensor,
    ) -> BackendResult<Self> {
        let pooling_dims = |dims: &[usize]| {
            <[usize; 4]>::try_from(dims).map_err(|_| {
                BackendError::execution(format!(
                    "{}: pooling expects rank 4 tensors, got {dims:?}",
                    layer.name
                ))
            })
        };
        let in_dims = pooling_dims(&input.dims)?;
        let out_dims = pooling_dims(&layer.output_dims)?;
        if in_dims[0] != out_dims[0] || in_dims[3] != out_dims[3] {
            return Err(BackendError::execution(format!(
                "{}: pooling must preserve batch and channels",
                layer.name
            )));
        }
        Ok(Self {
            descriptor: *descriptor,
            input: &input.data,
            in_dims,
            out_dims,
        })
    }
}

impl Kernel for Pool2dKernel<'_> {
    fn name(&self) -> &str {
        "RefPooling2d"
    }

    fn rows(&self) -> usize {
        self.out_dims[0] * self.out_dims[1] * self.out_dims[2]
    }

    fn row_len(&self) -> usize {
        self.out_dims[3]
    }

    fn run(&self, rows: Range<usize>, dst: &mut [f32]) -> BackendResult<()> {
        let d = &self.descriptor;
        let [_, in_h, in_w, channels] = self.in_dims;
        let [_, out_h, out_w, _] = self.out_dims;
        let (pool_h, pool_w) = (d.pool_height as isize, d.pool_width as isize);

        for (pixel, row) in rows.zip(dst.chunks_exact_mut(channels)) {
            let ow = (pixel % out_w) as isize;
            let oh = ((pixel / out_w) % out_h) as isize;
            let n = pixel / (out_w * out_h);

            // Window before clipping, bounded by the padded extent.
            let h_start = oh * d.stride_y as isize - d.pad_top as isize;
            let w_start = ow * d.stride_x as isize - d.pad_left as isize;
            let h_end = (h_start + pool_h).min(in_h as isize + d.pad_bottom as isize);
            let w_end = (w_start + pool_w).min(in_w as isize + d.pad_right as isize);
            let padded_count = ((h_end - h_start) * (w_end - w_start)).max(0) as usize;

            let (h_start, w_start) = (h_start.max(0) as usize, w_start.max(0) as usize);
            let (h_end, w_end) = (
                h_end.clamp(0, in_h as isize) as usize,
                w_end.clamp(0, in_w as isize) as usize,
            );
            let count = h_end.saturating_sub(h_start) * w_end.saturating_sub(w_start);
            let divisor = match d.padding_method {
                PaddingMethod::IgnoreValue => padded_count,
                PaddingMethod::Exclude => count,
            };

            for (c, out) in row.iter_mut().enumerate() {
                let mut acc = match d.algorithm {
                    PoolingAlgorithm::Max => f32::NEG_INFINITY,
                    PoolingAlgorithm::Average | PoolingAlgorithm::L2 => 0.0,
                };
                for y in h_start..h_end {
                    for x in w_start..w_end {
                        let v = self.input[((n * in_h + y) * in_w + x) * channels + c];
                        acc = match d.algorithm {
                            PoolingAlgorithm::Max => acc.max(v),
                            PoolingAlgorithm::Average => acc + v,
                            PoolingAlgorithm::L2 => acc + v * v,
                        };
                    }
                }
                *out = if count == 0 || divisor == 0 {
                    0.0
                } else {
                    match d.algorithm {
                        PoolingAlgorithm::Max => acc,
                        PoolingAlgorithm::Average => acc / divisor as f32,
                        PoolingAlgorithm::L2 => (acc / divisor as f32).sqrt(),
                    }
                };
            }
        }
        Ok(())
    }
}

pub struct ActivationKernel<'a> {
    function: ActivationFunction,
    input: &'a CpuTensor,
    row_len: usize,
}

impl Kernel for ActivationKernel<'_> {
    fn name(&self) -> &str {
        "RefActivation"
    }

    fn rows(&self) -> usize {
        self.input.len() / self.row_len
    }

    fn row_len(&self) -> usize {
        self.row_len
    }

    fn run(&self, rows: Range<usize>, dst: &mut [f32]) -> BackendResult<()> {
        let src = &self.input.data[rows.start * self.row_len..rows.end * self.row_len];
        for (out, x) in dst.iter_mut().zip(src) {
            *out = self.function.apply(*x);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Mul,
}

/// Elementwise binary op over equal-rank operands with extent-1 broadcasting.
pub struct BroadcastKernel<'a> {
    op: BinaryOp,
    lhs: &'a [f32],
    rhs: &'a [f32],
    lhs_strides: Vec<usize>,
    rhs_strides: Vec<usize>,
    out_dims: Vec<usize>,
}

impl<'a> BroadcastKernel<'a> {
    pub fn new(
        op: BinaryOp,
        lhs: &'a CpuTensor,
        rhs: &'a CpuTensor,
        out_dims: &[usize],
    ) -> BackendResult<Self> {
        Ok(Self {
            op,
            lhs: &lhs.data,
            rhs: &rhs.data,
            lhs_strides: broadcast_strides(&lhs.dims, out_dims)?,
            rhs_strides: broadcast_strides(&rhs.dims, out_dims)?,
            out_dims: out_dims.to_vec(),
        })
    }
}

impl Kernel for BroadcastKernel<'_> {
    fn name(&self) -> &str {
        match self.op {
            BinaryOp::Add => "RefAddition",
            BinaryOp::Mul => "RefMultiplication",
        }
    }

    fn rows(&self) -> usize {
        self.out_dims.iter().product::<usize>() / self.row_len()
    }

    fn row_len(&self) -> usize {
        last_extent(&self.out_dims)
    }

    fn run(&self, rows: Range<usize>, dst: &mut [f32]) -> BackendResult<()> {
        let first = rows.start * self.row_len();
        for (offset, out) in dst.iter_mut().enumerate() {
            let coords = unravel_index(first + offset, &self.out_dims);
            let (mut l, mut r) = (0usize, 0usize);
            for ((c, ls), rs) in coords.iter().zip(&self.lhs_strides).zip(&self.rhs_strides) {
                l += c * ls;
                r += c * rs;
            }
            *out = match self.op {
                BinaryOp::Add => self.lhs[l] + self.rhs[r],
                BinaryOp::Mul => self.lhs[l] * self.rhs[r],
            };
        }
        Ok(())
    }
}

/// Softmax over the innermost axis: `exp(beta * (x - max)) / sum`.
pub struct SoftmaxKernel<'a> {
    beta: f32,
    input: &'a CpuTensor,
    row_len: usize,
}

impl Kernel for SoftmaxKernel<'_> {
    fn name(&self) -> &str {
        "RefSoftmax"
    }

    fn rows(&self) -> usize {
        self.input.len() / self.row_len
    }

    fn row_len(&self) -> usize {
        self.row_len
    }

    fn run(&self, rows: Range<usize>, dst: &mut [f32]) -> BackendResult<()> {
        for (r, out) in rows.zip(dst.chunks_exact_mut(self.row_len)) {
            let src = &self.input.data[r * self.row_len..(r + 1) * self.row_len];
            let max = src.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for (o, x) in out.iter_mut().zip(src) {
                *o = (self.beta * (x - max)).exp();
                sum += *o;
            }
            for o in out.iter_mut() {
                *o /= sum;
            }
        }
        Ok(())
    }
}
