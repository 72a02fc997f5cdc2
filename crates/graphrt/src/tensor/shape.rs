//! Ordered tensor extents with at least one axis.

use std::fmt;
use std::ops::Index;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{Error, Result};

/// Stores the logical dimensions of a tensor.
///
/// Extents live inline for the ranks inference graphs actually use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    dims: SmallVec<[u32; 6]>,
}

impl TensorShape {
    /// Constructs a shape, rejecting rank 0.
    pub fn new(dims: &[u32]) -> Result<Self> {
        if dims.is_empty() {
            return Err(Error::graph_invalid(
                "tensor shape must have at least one dimension",
            ));
        }
        Ok(Self {
            dims: dims.iter().copied().collect(),
        })
    }

    /// Constructs a shape from extents known to be non-empty, such as literals.
    ///
    /// # Panics
    ///
    /// Panics if `dims` is empty. Use [`TensorShape::new`] for untrusted extents.
    pub fn from_dims(dims: &[u32]) -> Self {
        assert!(!dims.is_empty(), "shape must have at least one dimension");
        Self {
            dims: dims.iter().copied().collect(),
        }
    }

    pub fn dims(&self) -> &[u32] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements, `None` on overflow.
    pub fn num_elements(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim as usize))
    }

    /// Extents widened to `usize` for indexing arithmetic.
    pub fn to_usize_vec(&self) -> Vec<usize> {
        self.dims.iter().map(|&dim| dim as usize).collect()
    }
}

impl Index<usize> for TensorShape {
    type Output = u32;

    fn index(&self, index: usize) -> &u32 {
        &self.dims[index]
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

impl From<TensorShape> for Vec<u32> {
    fn from(shape: TensorShape) -> Self {
        shape.dims.into_vec()
    }
}
