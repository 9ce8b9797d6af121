use crate::{rvec, RVec};
use std::slice::Iter;

/// Tensor extent, outermost dimension first.
///
/// Kernels interpret shapes as BHWC. Shapes of lower rank are promoted by
/// padding on the left with ones.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(RVec<usize>);

impl Shape {
    pub fn new(shape: RVec<usize>) -> Self {
        Self(shape)
    }

    pub fn inner(&self) -> &RVec<usize> {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<&usize> {
        self.0.get(index)
    }

    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.0.to_vec()
    }

    pub fn iter(&self) -> Iter<'_, usize> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rank(&self) -> usize {
        self.len()
    }

    #[inline]
    pub fn left_pad_to(&mut self, scalar: usize, rank: usize) {
        while self.0.len() < rank {
            self.0.insert(0, scalar);
        }
    }

    #[inline]
    pub fn promote(shape: Shape, rank: usize) -> Shape {
        let mut shape = shape;
        shape.left_pad_to(1, rank);
        shape
    }

    fn bhwc(&self) -> [usize; 4] {
        let promoted = Self::promote(self.clone(), 4);
        let n = promoted.len();
        [
            promoted.0[n - 4],
            promoted.0[n - 3],
            promoted.0[n - 2],
            promoted.0[n - 1],
        ]
    }

    pub fn batch(&self) -> usize {
        self.bhwc()[0]
    }

    pub fn height(&self) -> usize {
        self.bhwc()[1]
    }

    pub fn width(&self) -> usize {
        self.bhwc()[2]
    }

    pub fn channels(&self) -> usize {
        self.bhwc()[3]
    }

    /// Number of 4-channel slices, the unit kernels vectorize over.
    pub fn slices(&self) -> usize {
        self.channels().div_ceil(4)
    }
}

impl std::fmt::Debug for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut shape = format!("[{}", self.0.first().unwrap_or(&0));
        for dim in self.0.iter().skip(1) {
            shape.push_str(&format!("x{dim}"));
        }
        write!(f, "{shape}]")
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl std::ops::Index<usize> for Shape {
    type Output = usize;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl From<&[usize]> for Shape {
    fn from(slice: &[usize]) -> Self {
        Shape(slice.into())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(vec: Vec<usize>) -> Self {
        Shape(vec.into())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape(dims.as_slice().into())
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((b, h, w, c): (usize, usize, usize, usize)) -> Self {
        Shape(rvec![b, h, w, c])
    }
}
