use super::{add_scalar, check_unary};
use crate::{
    ElementwiseOperation, Expr, InvariantError, Operation, OperationDef, OperationError, Stmt,
    FRAGMENT_INPUT, FRAGMENT_OUTPUT,
};

/// `out = clamp(in, min, max)`.
pub fn clamp(
    def: OperationDef,
    min: f32,
    max: f32,
) -> Result<ElementwiseOperation, OperationError> {
    check_unary(&def)?;
    if min > max || min.is_nan() || max.is_nan() {
        return Err(InvariantError::InvalidRange { min, max }.into());
    }
    let mut op = ElementwiseOperation::new(
        "clamp",
        def,
        vec![Stmt::Let(
            FRAGMENT_OUTPUT.to_string(),
            Expr::clamp(
                Expr::value(FRAGMENT_INPUT),
                Expr::scalar("clamp_min"),
                Expr::scalar("clamp_max"),
            ),
        )],
    );
    add_scalar(op.gpu_op_mut(), "clamp_min", min);
    add_scalar(op.gpu_op_mut(), "clamp_max", max);
    Ok(op)
}
