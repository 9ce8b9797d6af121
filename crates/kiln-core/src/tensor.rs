use crate::{DType, Shape, StorageType, TensorDescriptor};
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Non-owning reference to a tensor living in a [`TensorPool`].
    pub struct TensorHandle;
}

#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    #[error("Tensor {0:?} is not present in the pool")]
    Stale(TensorHandle),
    #[error("Data length {actual} does not match shape {shape:?} ({expected} elements)")]
    DataLength {
        shape: Shape,
        expected: usize,
        actual: usize,
    },
}

/// A tensor resource.
///
/// The host mirror in `data` is dense BHWC and is what the reference backend
/// reads and writes. Values are kept rounded to the descriptor's dtype.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Shape,
    descriptor: TensorDescriptor,
    data: Vec<f32>,
}

impl Tensor {
    pub fn zeros(shape: impl Into<Shape>, descriptor: TensorDescriptor) -> Self {
        let shape = shape.into();
        let data = vec![0.; shape.numel()];
        Self {
            shape,
            descriptor,
            data,
        }
    }

    pub fn from_data(
        data: Vec<f32>,
        shape: impl Into<Shape>,
        descriptor: TensorDescriptor,
    ) -> Result<Self, TensorError> {
        let shape = shape.into();
        if data.len() != shape.numel() {
            return Err(TensorError::DataLength {
                expected: shape.numel(),
                actual: data.len(),
                shape,
            });
        }
        let data = data.into_iter().map(|v| descriptor.dtype.round(v)).collect();
        Ok(Self {
            shape,
            descriptor,
            data,
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn descriptor(&self) -> &TensorDescriptor {
        &self.descriptor
    }

    pub fn dtype(&self) -> DType {
        self.descriptor.dtype
    }

    pub fn storage_type(&self) -> StorageType {
        self.descriptor.storage_type
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.clone()
    }

    #[inline]
    fn offset(&self, b: usize, y: usize, x: usize, c: usize) -> usize {
        let s = &self.shape;
        ((b * s.height() + y) * s.width() + x) * s.channels() + c
    }

    /// Reads one element. Channels past the tensor's extent read as zero.
    #[inline]
    pub fn read(&self, b: usize, y: usize, x: usize, c: usize) -> f32 {
        if c >= self.shape.channels() {
            return 0.;
        }
        self.data[self.offset(b, y, x, c)]
    }

    /// Writes one element. Channels past the tensor's extent are dropped.
    #[inline]
    pub fn write(&mut self, b: usize, y: usize, x: usize, c: usize, value: f32) {
        if c >= self.shape.channels() {
            return;
        }
        let offset = self.offset(b, y, x, c);
        self.data[offset] = self.descriptor.dtype.round(value);
    }
}

/// Caller-owned arena of tensors.
///
/// Operations hold [`TensorHandle`]s into the pool; a removed tensor turns
/// every handle to it stale, which surfaces as an error at the next access.
#[derive(Debug, Default)]
pub struct TensorPool {
    tensors: SlotMap<TensorHandle, Tensor>,
}

impl TensorPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tensor: Tensor) -> TensorHandle {
        self.tensors.insert(tensor)
    }

    pub fn remove(&mut self, handle: TensorHandle) -> Option<Tensor> {
        self.tensors.remove(handle)
    }

    pub fn get(&self, handle: TensorHandle) -> Result<&Tensor, TensorError> {
        self.tensors.get(handle).ok_or(TensorError::Stale(handle))
    }

    pub fn get_mut(&mut self, handle: TensorHandle) -> Result<&mut Tensor, TensorError> {
        self.tensors
            .get_mut(handle)
            .ok_or(TensorError::Stale(handle))
    }

    pub fn contains(&self, handle: TensorHandle) -> bool {
        self.tensors.contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}
