use crate::DType;
use derive_new::new;
use std::sync::Arc;

/// How a tensor is laid out in device memory.
///
/// Generated kernels embed the storage type of every tensor they touch, so a
/// tensor bound after compilation must keep the storage type it was compiled
/// against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StorageType {
    #[default]
    Buffer,
    ImageBuffer,
    Texture2D,
    TextureArray,
    Texture3D,
    SingleTexture2D,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Buffer => "buffer",
            StorageType::ImageBuffer => "image_buffer",
            StorageType::Texture2D => "texture_2d",
            StorageType::TextureArray => "texture_array",
            StorageType::Texture3D => "texture_3d",
            StorageType::SingleTexture2D => "single_texture_2d",
        }
    }

    /// Whether the layout can fold a batch dimension greater than one into its
    /// addressing.
    pub fn supports_batch(&self) -> bool {
        !matches!(self, StorageType::SingleTexture2D)
    }

    pub fn is_texture(&self) -> bool {
        matches!(
            self,
            StorageType::Texture2D
                | StorageType::TextureArray
                | StorageType::Texture3D
                | StorageType::SingleTexture2D
        )
    }
}

/// Element type and storage layout of a tensor, as seen by a kernel.
#[derive(new, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TensorDescriptor {
    pub dtype: DType,
    pub storage_type: StorageType,
}

impl TensorDescriptor {
    pub fn buffer(dtype: DType) -> Self {
        Self::new(dtype, StorageType::Buffer)
    }

    pub fn texture_2d(dtype: DType) -> Self {
        Self::new(dtype, StorageType::Texture2D)
    }
}

/// Per-channel constant data bound as a read-only buffer argument.
#[derive(new, Debug, Clone, PartialEq)]
pub struct BufferDescriptor {
    pub dtype: DType,
    pub data: Arc<[f32]>,
}

impl BufferDescriptor {
    pub fn from_vec(dtype: DType, data: Vec<f32>) -> Self {
        let data = data.into_iter().map(|v| dtype.round(v)).collect();
        Self { dtype, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
