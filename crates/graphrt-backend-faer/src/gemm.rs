//! GEMM lowerings of convolution and fully connected layers.
//!
//! Both kernels produce a block of output rows with a single faer `matmul`. The output is
//! row-major `[rows, out]`, which faer sees as a column-major `[out, rows]` matrix, so every
//! product is computed transposed: `C^T = W * X^T`.

use std::cell::RefCell;
use std::ops::Range;

use faer::linalg::matmul::matmul;
use faer::mat::{MatMut, MatRef};
use faer::{Accum, Par};
use graphrt::backend::{BackendResult, Kernel};
use graphrt::graph::{ActivationFunction, Convolution2dDescriptor, FullyConnectedDescriptor};
use graphrt_backend_ref_cpu::kernels::{finish_rows, Conv2dGeometry, FullyConnectedGeometry};
use graphrt_backend_ref_cpu::{CpuLayer, CpuTensor};

/// Output pixels unrolled per GEMM when a receptive field has to be gathered.
const IM2COL_TILE_ROWS: usize = 256;

thread_local! {
    static IM2COL_SCRATCH_F32: RefCell<Vec<f32>> = const { RefCell::new(Vec::new()) };
}

/// `dst[rows, n] = lhs[rows, k] * rhs^T` where `rhs` is the row-major `[n, k]` matrix.
fn gemm_rows(dst: &mut [f32], lhs: &[f32], rhs: MatRef<'_, f32>, rows: usize, k: usize) {
    let n = rhs.nrows();
    let lhs_view = MatRef::from_row_major_slice(lhs, rows, k);
    let mut out_view = MatMut::from_column_major_slice_mut(dst, n, rows);
    matmul(
        &mut out_view,
        Accum::Replace,
        rhs,
        lhs_view.transpose(),
        1.0f32,
        Par::Seq,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvStrategy {
    /// 1x1 unpadded kernels read each receptive field straight from the input.
    Pointwise,
    /// Everything else unrolls receptive fields into a scratch tile first.
    Im2Col,
}

impl ConvStrategy {
    pub fn select(descriptor: &Convolution2dDescriptor, geometry: &Conv2dGeometry) -> Self {
        let unpadded = descriptor.pad_left == 0
            && descriptor.pad_right == 0
            && descriptor.pad_top == 0
            && descriptor.pad_bottom == 0;
        if geometry.kernel_h == 1 && geometry.kernel_w == 1 && unpadded {
            ConvStrategy::Pointwise
        } else {
            ConvStrategy::Im2Col
        }
    }
}

/// NHWC convolution as `[pixels, kh*kw*in_c] x [out_c, kh*kw*in_c]^T`.
///
/// The `[O, KH, KW, I]` weight layout is already the row-major `[out_c, patch]` matrix.
pub struct ConvGemmKernel<'a> {
    geometry: Conv2dGeometry,
    strategy: ConvStrategy,
    input: &'a [f32],
    weights: &'a [f32],
    bias: Option<&'a [f32]>,
    activation: Option<ActivationFunction>,
}

impl<'a> ConvGemmKernel<'a> {
    pub fn new(
        layer: &'a CpuLayer,
        descriptor: &Convolution2dDescriptor,
        input: &'a CpuTensor,
    ) -> BackendResult<Self> {
        let weights = layer.expect_weights()?;
        let geometry =
            Conv2dGeometry::new(descriptor, &input.dims, &weights.dims, &layer.output_dims)?;
        Ok(Self {
            strategy: ConvStrategy::select(descriptor, &geometry),
            geometry,
            input: &input.data,
            weights: &weights.data,
            bias: layer.bias.as_deref(),
            activation: descriptor.fused_activation,
        })
    }

    pub fn strategy(&self) -> ConvStrategy {
        self.strategy
    }

    fn weight_matrix(&self) -> MatRef<'a, f32> {
        let g = &self.geometry;
        MatRef::from_row_major_slice(self.weights, g.out_c, g.patch_len())
    }

    fn run_pointwise(&self, rows: Range<usize>, dst: &mut [f32]) {
        let g = &self.geometry;
        let count = rows.len();
        if g.stride_x == 1 && g.stride_y == 1 {
            // Output pixels map one to one onto input pixels.
            let lhs = &self.input[rows.start * g.in_c..rows.end * g.in_c];
            gemm_rows(dst, lhs, self.weight_matrix(), count, g.in_c);
            return;
        }
        with_scratch(count * g.in_c, |scratch| {
            for (pixel, patch) in rows.zip(scratch.chunks_exact_mut(g.in_c)) {
                g.unroll_patch(self.input, pixel, patch);
            }
            gemm_rows(dst, scratch, self.weight_matrix(), count, g.in_c);
        });
    }

    fn run_im2col(&self, rows: Range<usize>, dst: &mut [f32]) {
        let g = &self.geometry;
        let patch = g.patch_len();
        let tile = IM2COL_TILE_ROWS.min(rows.len()).max(1);
        with_scratch(tile * patch, |scratch| {
            let mut start = rows.start;
            for block in dst.chunks_mut(tile * g.out_c) {
                let count = block.len() / g.out_c;
                let patches = &mut scratch[..count * patch];
                for (pixel, field) in (start..start + count).zip(patches.chunks_exact_mut(patch)) {
                    g.unroll_patch(self.input, pixel, field);
                }
                gemm_rows(block, patches, self.weight_matrix(), count, patch);
                start += count;
            }
        });
    }
}

fn with_scratch<R>(len: usize, f: impl FnOnce(&mut [f32]) -> R) -> R {
    IM2COL_SCRATCH_F32.with(|cell| {
        let mut scratch = cell.borrow_mut();
        if scratch.len() < len {
            scratch.resize(len, 0.0);
        }
        f(&mut scratch[..len])
    })
}

impl Kernel for ConvGemmKernel<'_> {
    fn name(&self) -> &str {
        match self.strategy {
            ConvStrategy::Pointwise => "FaerConvolution2dPointwise",
            ConvStrategy::Im2Col => "FaerConvolution2dIm2Col",
        }
    }

    fn rows(&self) -> usize {
        self.geometry.output_pixels()
    }

    fn row_len(&self) -> usize {
        self.geometry.out_c
    }

    fn run(&self, rows: Range<usize>, dst: &mut [f32]) -> BackendResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        match self.strategy {
            ConvStrategy::Pointwise => self.run_pointwise(rows, dst),
            ConvStrategy::Im2Col => self.run_im2col(rows, dst),
        }
        finish_rows(dst, self.geometry.out_c, self.bias, self.activation);
        Ok(())
    }
}

pub struct FullyConnectedGemmKernel<'a> {
    geometry: FullyConnectedGeometry,
    input: &'a [f32],
    weights: &'a [f32],
    bias: Option<&'a [f32]>,
    activation: Option<ActivationFunction>,
}

impl<'a> FullyConnectedGemmKernel<'a> {
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

    /// Weights as the `[out, in]` matrix.
    fn weight_matrix(&self) -> MatRef<'a, f32> {
        let g = &self.geometry;
        if g.transpose_weights {
            MatRef::from_row_major_slice(self.weights, g.out_features, g.in_features)
        } else {
            MatRef::from_row_major_slice(self.weights, g.in_features, g.out_features).transpose()
        }
    }
}

impl Kernel for FullyConnectedGemmKernel<'_> {
    fn name(&self) -> &str {
        "FaerFullyConnected"
    }

    fn rows(&self) -> usize {
        self.geometry.batch
    }

    fn row_len(&self) -> usize {
        self.geometry.out_features
    }

    fn run(&self, rows: Range<usize>, dst: &mut [f32]) -> BackendResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let g = &self.geometry;
        let lhs = &self.input[rows.start * g.in_features..rows.end * g.in_features];
        gemm_rows(dst, lhs, self.weight_matrix(), rows.len(), g.in_features);
        finish_rows(dst, g.out_features, self.bias, self.activation);
        Ok(())
    }
}
