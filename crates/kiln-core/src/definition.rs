use crate::{DType, Precision, RVec, StorageType, TensorDescriptor};
use derive_new::new;

/// Precision and tensor formats of an operation.
///
/// Generated code embeds every choice made here, so a definition is fixed
/// once the operation that owns it has been built.
#[derive(new, Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct OperationDef {
    pub precision: Precision,
    pub src_tensors: RVec<TensorDescriptor>,
    pub dst_tensors: RVec<TensorDescriptor>,
}

impl OperationDef {
    /// Single input, single output definition with the same descriptor on both
    /// sides.
    pub fn unary(precision: Precision, descriptor: TensorDescriptor) -> Self {
        Self::new(
            precision,
            crate::rvec![descriptor],
            crate::rvec![descriptor],
        )
    }

    /// F32 for full precision, F16 otherwise.
    pub fn data_type(&self) -> DType {
        self.precision.storage_dtype()
    }

    /// Data type of the first source tensor.
    ///
    /// The first source usually dictates the structure of the kernel; every
    /// auxiliary resource has to be compatible with it.
    pub fn primary_data_type(&self) -> DType {
        self.src_tensors
            .first()
            .map(|d| d.dtype)
            .unwrap_or_else(|| self.data_type())
    }

    pub fn primary_storage_type(&self) -> StorageType {
        self.src_tensors
            .first()
            .map(|d| d.storage_type)
            .unwrap_or_default()
    }

    pub fn has_all_tensors_of_type(&self, storage_type: StorageType) -> bool {
        self.src_tensors
            .iter()
            .chain(self.dst_tensors.iter())
            .all(|d| d.storage_type == storage_type)
    }

    pub fn is_batch_supported(&self) -> bool {
        self.src_tensors
            .iter()
            .chain(self.dst_tensors.iter())
            .all(|d| d.storage_type.supports_batch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rvec;

    #[test]
    fn test_primary_queries() {
        let def = OperationDef::new(
            Precision::F16,
            rvec![
                TensorDescriptor::texture_2d(DType::F16),
                TensorDescriptor::buffer(DType::F16)
            ],
            rvec![TensorDescriptor::texture_2d(DType::F16)],
        );
        assert_eq!(def.data_type(), DType::F16);
        assert_eq!(def.primary_storage_type(), StorageType::Texture2D);
        assert!(!def.has_all_tensors_of_type(StorageType::Texture2D));
        assert!(def.is_batch_supported());
    }

    #[test]
    fn test_single_texture_blocks_batch() {
        let def = OperationDef::unary(
            Precision::F32,
            TensorDescriptor::new(DType::F32, StorageType::SingleTexture2D),
        );
        assert!(def.has_all_tensors_of_type(StorageType::SingleTexture2D));
        assert!(!def.is_batch_supported());
    }
}
