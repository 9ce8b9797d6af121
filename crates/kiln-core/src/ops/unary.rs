use super::check_unary;
use crate::{
    ElementwiseOperation, Expr, OperationDef, OperationError, Stmt, UnaryFn, FRAGMENT_INPUT,
    FRAGMENT_OUTPUT,
};

/// `out = f(in)`.
pub fn unary(def: OperationDef, f: UnaryFn) -> Result<ElementwiseOperation, OperationError> {
    check_unary(&def)?;
    Ok(ElementwiseOperation::new(
        f.name(),
        def,
        vec![Stmt::Let(
            FRAGMENT_OUTPUT.to_string(),
            Expr::unary(f, Expr::value(FRAGMENT_INPUT)),
        )],
    ))
}
