use half::f16;
use std::fmt::Display;

/// Element type of a tensor or of kernel arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    F16,
    #[default]
    F32,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::F32 => "f32",
        }
    }

    pub fn size_of(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
        }
    }

    /// Rounds `value` to the nearest value representable in this type.
    #[inline]
    pub fn round(&self, value: f32) -> f32 {
        match self {
            DType::F16 => f16::from_f32(value).to_f32(),
            DType::F32 => value,
        }
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Precision an operation computes in.
///
/// `F32F16` stores intermediate tensors as f16 but does the arithmetic in f32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Precision {
    #[default]
    F32,
    F32F16,
    F16,
}

impl Precision {
    /// Type the tensors of an operation are stored in.
    pub fn storage_dtype(&self) -> DType {
        match self {
            Precision::F32 => DType::F32,
            Precision::F32F16 | Precision::F16 => DType::F16,
        }
    }

    /// Type the kernel does its arithmetic in.
    pub fn compute_dtype(&self) -> DType {
        match self {
            Precision::F32 | Precision::F32F16 => DType::F32,
            Precision::F16 => DType::F16,
        }
    }

    pub fn is_reduced(&self) -> bool {
        !matches!(self, Precision::F32)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::F32 => "f32",
            Precision::F32F16 => "f32_f16",
            Precision::F16 => "f16",
        }
    }
}

impl Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_types() {
        assert_eq!(Precision::F32.storage_dtype(), DType::F32);
        assert_eq!(Precision::F32F16.storage_dtype(), DType::F16);
        assert_eq!(Precision::F32F16.compute_dtype(), DType::F32);
        assert_eq!(Precision::F16.compute_dtype(), DType::F16);
        assert!(!Precision::F32.is_reduced());
    }

    #[test]
    fn test_f16_rounding() {
        assert_eq!(DType::F16.round(1.0), 1.0);
        assert_ne!(DType::F16.round(0.1), 0.1);
        assert_eq!(DType::F32.round(0.1), 0.1);
    }
}
