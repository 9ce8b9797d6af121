use half::f16;
use std::fmt::{Debug, Display};

/// Scalar types a kernel can be rendered with.
pub trait WgslDType: Debug + Display + Default + Copy + num_traits::Num + num_traits::Zero {
    const DT: &'static str;

    /// Literal with the WGSL type suffix.
    fn render(&self) -> String;
}

impl WgslDType for f32 {
    const DT: &'static str = "f32";

    fn render(&self) -> String {
        format!("{self}f")
    }
}

impl WgslDType for f16 {
    const DT: &'static str = "f16";

    fn render(&self) -> String {
        format!("{self}h")
    }
}

impl WgslDType for i32 {
    const DT: &'static str = "i32";

    fn render(&self) -> String {
        format!("{self}i")
    }
}

impl WgslDType for u32 {
    const DT: &'static str = "u32";

    fn render(&self) -> String {
        format!("{self}u")
    }
}

/// Renders `value` as a literal of the given element type.
pub(crate) fn render_literal(dtype: crate::DType, value: f32) -> String {
    match dtype {
        crate::DType::F32 => value.render(),
        crate::DType::F16 => f16::from_f32(value).render(),
    }
}

pub(crate) fn type_name(dtype: crate::DType) -> &'static str {
    match dtype {
        crate::DType::F32 => f32::DT,
        crate::DType::F16 => f16::DT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DType;

    #[test]
    fn test_literals() {
        assert_eq!(render_literal(DType::F32, 0.5), "0.5f");
        assert_eq!(render_literal(DType::F16, 1.0), "1h");
        assert_eq!(3i32.render(), "3i");
    }
}
