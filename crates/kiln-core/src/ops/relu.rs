use super::{add_scalar, check_unary};
use crate::{
    BinaryFn, ElementwiseOperation, Expr, Operation, OperationDef, OperationError, Stmt,
    FRAGMENT_INPUT, FRAGMENT_OUTPUT,
};

/// Leaky ReLU with an optional upper bound:
/// `out = min(max(in, 0) + alpha * min(in, 0), clip)`.
///
/// `alpha == 0` gives a plain ReLU; the `alpha` term is left out of the
/// kernel entirely in that case.
pub fn relu(
    def: OperationDef,
    alpha: f32,
    clip: Option<f32>,
) -> Result<ElementwiseOperation, OperationError> {
    check_unary(&def)?;
    let x = || Expr::value(FRAGMENT_INPUT);
    let zero = || Expr::Literal(0.);

    let mut value = Expr::binary(BinaryFn::Max, x(), zero());
    if alpha != 0. {
        value = Expr::binary(
            BinaryFn::Add,
            value,
            Expr::binary(
                BinaryFn::Mul,
                Expr::scalar("alpha"),
                Expr::binary(BinaryFn::Min, x(), zero()),
            ),
        );
    }
    if clip.is_some() {
        value = Expr::binary(BinaryFn::Min, value, Expr::scalar("clip"));
    }

    let mut op = ElementwiseOperation::new(
        "relu",
        def,
        vec![Stmt::Let(FRAGMENT_OUTPUT.to_string(), value)],
    );
    if alpha != 0. {
        add_scalar(op.gpu_op_mut(), "alpha", alpha);
    }
    if let Some(clip) = clip {
        add_scalar(op.gpu_op_mut(), "clip", clip);
    }
    Ok(op)
}
