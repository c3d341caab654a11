use std::fmt;

use crate::error::{Error, Result};
use crate::text_format::{TextMessage, TextNode};

// Shape - N-dimensional static shape of a logical blob
//
// A Shape describes the size of each dimension of a blob:
//   - Scalar: Shape([])          - 0 dimensions, 1 element
//   - Vector: Shape([5])         - 1 dimension, 5 elements
//   - Matrix: Shape([3, 4])      - 2 dimensions, 12 elements
//
// For dynamic (mirrored) blobs the declared shape is a capacity: real data
// may have fewer elements, never more. Descriptor shapes must be strictly
// positive in every dimension and their element count must fit in a
// usize; `check_positive` enforces both.
//
// In structured text a shape is a repeated `dim` field:
//   shape { dim: 2 dim: 3 }

/// N-dimensional shape of a blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// Build a shape from signed dims, rejecting anything below 1.
    pub fn from_i64s(dims: &[i64]) -> Result<Self> {
        let mut out = Vec::with_capacity(dims.len());
        for &d in dims {
            if d <= 0 {
                return Err(Error::InvalidArgBlobDef(format!(
                    "shape {dims:?} must contain only positive dims"
                )));
            }
            out.push(d as usize);
        }
        let shape = Shape(out);
        shape.checked_elem_count()?;
        Ok(shape)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn to_i64s(&self) -> Vec<i64> {
        self.0.iter().map(|&d| d as i64).collect()
    }

    /// Number of dimensions (0 for scalar).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    /// A scalar shape [] has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Element count, failing instead of overflowing.
    pub fn checked_elem_count(&self) -> Result<usize> {
        self.0
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| {
                Error::InvalidArgBlobDef(format!("shape {self} has too many elements"))
            })
    }

    pub fn dim(&self, d: usize) -> Option<usize> {
        self.0.get(d).copied()
    }

    /// Fails unless the shape has at least one dim and every dim is positive.
    pub fn check_positive(&self) -> Result<()> {
        if self.0.is_empty() || self.0.contains(&0) {
            return Err(Error::InvalidArgBlobDef(format!(
                "shape {self} must be a non-empty tuple of positive integers"
            )));
        }
        self.checked_elem_count().map(|_| ())
    }

    /// Copy of this shape with dimension `axis` replaced.
    pub fn with_dim(&self, axis: usize, size: usize) -> Shape {
        let mut dims = self.0.clone();
        if let Some(d) = dims.get_mut(axis) {
            *d = size;
        }
        Shape(dims)
    }

    // Broadcasting

    /// Compute the broadcast output shape from two input shapes.
    ///
    /// NumPy-style broadcasting rules:
    ///   1. Align shapes from the right (trailing dimensions).
    ///   2. Dimensions are compatible if they are equal or one of them is 1.
    ///   3. Missing leading dimensions are treated as 1.
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Option<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd || rd == 1 {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else {
                return None;
            }
        }

        result.reverse();
        Some(Shape::new(result))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl TextMessage for Shape {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        node.set_ints("dim", self.to_i64s());
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        let dims = node.ints("dim")?;
        if dims.iter().any(|&d| d < 0) {
            return Err(Error::schema("dim", "negative dimension"));
        }
        let shape = Shape(dims.into_iter().map(|d| d as usize).collect());
        shape
            .checked_elem_count()
            .map_err(|_| Error::schema("dim", format!("{shape} has too many elements")))?;
        Ok(shape)
    }
}

// Convenient From implementations

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize,)> for Shape {
    fn from((d0,): (usize,)) -> Self {
        Shape(vec![d0])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}
