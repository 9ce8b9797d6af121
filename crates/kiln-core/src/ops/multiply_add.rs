use super::{add_scalar, check_unary};
use crate::{
    BinaryFn, BufferDescriptor, ElementwiseOperation, Expr, GpuOperation, InvariantError,
    Operation, OperationDef, OperationError, Stmt, FRAGMENT_INPUT, FRAGMENT_OUTPUT,
};

/// A multiplier or addend: one value for every channel, or one per channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelParam {
    Scalar(f32),
    PerChannel(Vec<f32>),
}

impl ChannelParam {
    fn expr(&self, stem: &str) -> Expr {
        match self {
            ChannelParam::Scalar(_) => Expr::scalar(format!("{stem}_scalar")),
            ChannelParam::PerChannel(_) => Expr::channel(format!("{stem}_buffer")),
        }
    }

    fn declare(&self, op: &mut GpuOperation, stem: &str) -> Result<(), InvariantError> {
        match self {
            ChannelParam::Scalar(v) => add_scalar(op, &format!("{stem}_scalar"), *v),
            ChannelParam::PerChannel(values) => {
                if values.is_empty() {
                    return Err(InvariantError::ChannelCount {
                        expected: 1,
                        actual: 0,
                    });
                }
                // Padded to whole slices; kernels index the buffer per slice.
                let mut data = values.clone();
                data.resize(values.len().div_ceil(4) * 4, 0.);
                let dtype = op.definition().data_type();
                op.add_src_buffer(
                    format!("{stem}_buffer"),
                    BufferDescriptor::from_vec(dtype, data),
                );
            }
        }
        Ok(())
    }
}

/// Scale and bias: `out = in * mul + add`.
pub fn multiply_add(
    def: OperationDef,
    mul: ChannelParam,
    add: ChannelParam,
) -> Result<ElementwiseOperation, OperationError> {
    check_unary(&def)?;
    let code = vec![Stmt::Let(
        FRAGMENT_OUTPUT.to_string(),
        Expr::binary(
            BinaryFn::Add,
            Expr::binary(BinaryFn::Mul, Expr::value(FRAGMENT_INPUT), mul.expr("mul")),
            add.expr("add"),
        ),
    )];
    let mut op = ElementwiseOperation::new("multiply_add", def, code);
    mul.declare(op.gpu_op_mut(), "mul")?;
    add.declare(op.gpu_op_mut(), "add")?;
    Ok(op)
}
