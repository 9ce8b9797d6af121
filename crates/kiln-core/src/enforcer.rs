use std::ops::RangeInclusive;

use crate::DType;

/// Violations of an operation's structural requirements, detected when the
/// operation is built.
#[derive(Debug, thiserror::Error)]
pub enum InvariantError {
    #[error("Wrong input arity. Allowed range is {accepted:?}, definition has {actual}.")]
    InputArity {
        accepted: RangeInclusive<usize>,
        actual: usize,
    },
    #[error("Wrong output arity. Allowed is {accepted:?}, definition has {actual}.")]
    OutputArity {
        accepted: RangeInclusive<usize>,
        actual: usize,
    },
    #[error("DType mismatch, expected {expected:?}, got {actual:?}.")]
    DTypeMismatch { expected: DType, actual: DType },
    #[error("Invalid range: min {min} is greater than max {max}.")]
    InvalidRange { min: f32, max: f32 },
    #[error("Per-channel data has {actual} values, expected {expected}.")]
    ChannelCount { expected: usize, actual: usize },
}

pub(crate) fn check_arity(
    def: &crate::OperationDef,
    inputs: RangeInclusive<usize>,
    outputs: RangeInclusive<usize>,
) -> Result<(), InvariantError> {
    if !inputs.contains(&def.src_tensors.len()) {
        return Err(InvariantError::InputArity {
            accepted: inputs,
            actual: def.src_tensors.len(),
        });
    }
    if !outputs.contains(&def.dst_tensors.len()) {
        return Err(InvariantError::OutputArity {
            accepted: outputs,
            actual: def.dst_tensors.len(),
        });
    }
    Ok(())
}

/// Every tensor of `def` must hold the definition's storage data type.
pub(crate) fn check_dtypes(def: &crate::OperationDef) -> Result<(), InvariantError> {
    let expected = def.data_type();
    for desc in def.src_tensors.iter().chain(def.dst_tensors.iter()) {
        if desc.dtype != expected {
            return Err(InvariantError::DTypeMismatch {
                expected,
                actual: desc.dtype,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{rvec, OperationDef, Precision, TensorDescriptor};

    #[test]
    fn test_arity() {
        let def = OperationDef::unary(Precision::F32, TensorDescriptor::buffer(DType::F32));
        assert!(check_arity(&def, 1..=1, 1..=1).is_ok());
        assert!(matches!(
            check_arity(&def, 2..=2, 1..=1),
            Err(InvariantError::InputArity { actual: 1, .. })
        ));
    }

    #[test]
    fn test_dtype_follows_precision() {
        let def = OperationDef::new(
            Precision::F16,
            rvec![TensorDescriptor::buffer(DType::F32)],
            rvec![TensorDescriptor::buffer(DType::F16)],
        );
        assert!(matches!(
            check_dtypes(&def),
            Err(InvariantError::DTypeMismatch {
                expected: DType::F16,
                ..
            })
        ));
    }
}
