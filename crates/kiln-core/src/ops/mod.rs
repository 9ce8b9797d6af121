//! Elementwise operations.
//!
//! Each constructor validates the definition and returns an
//! [`ElementwiseOperation`](crate::ElementwiseOperation) that can be
//! dispatched on its own or linked into a host.

mod add;
mod clamp;
mod multiply_add;
mod relu;
mod unary;

pub use add::*;
pub use clamp::*;
pub use multiply_add::*;
pub use relu::*;
pub use unary::*;

use crate::enforcer::{check_arity, check_dtypes};
use crate::{GpuOperation, OperationDef, OperationError, Precision};
use half::f16;

/// Declares a scalar argument in the arithmetic type of `op`.
pub(crate) fn add_scalar(op: &mut GpuOperation, name: &str, value: f32) {
    if op.precision() == Precision::F16 {
        op.args_mut().add_half(name, f16::from_f32(value));
    } else {
        op.args_mut().add_float(name, value);
    }
}

pub(crate) fn check_unary(def: &OperationDef) -> Result<(), OperationError> {
    check_arity(def, 1..=1, 1..=1)?;
    check_dtypes(def)?;
    Ok(())
}
