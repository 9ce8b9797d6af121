use crate::enforcer::{check_arity, check_dtypes};
use crate::{
    BinaryFn, ElementwiseOperation, Expr, InvariantError, Operation, OperationDef,
    OperationError, Stmt, FRAGMENT_INPUT, FRAGMENT_OUTPUT,
};

/// Sums all sources: `out = in + src_1 + ... + src_n`.
///
/// `channels` holds the channel count of every source. Sources whose count
/// differs from the first are read with a channel guard (missing channels
/// read as zero). Such an add cannot be linked, since the guard depends on
/// the host's own channel layout.
pub fn add(def: OperationDef, channels: &[usize]) -> Result<ElementwiseOperation, OperationError> {
    check_arity(&def, 2..=8, 1..=1)?;
    check_dtypes(&def)?;
    if channels.len() != def.src_tensors.len() {
        return Err(InvariantError::ChannelCount {
            expected: def.src_tensors.len(),
            actual: channels.len(),
        }
        .into());
    }

    let mut value = Expr::value(FRAGMENT_INPUT);
    let mut uniform = true;
    for (i, c) in channels.iter().enumerate().skip(1) {
        let name = format!("src_tensor_{i}");
        let read = if *c == channels[0] {
            Expr::read(name)
        } else {
            uniform = false;
            Expr::read_guarded(name)
        };
        value = Expr::binary(BinaryFn::Add, value, read);
    }

    let extra = def.src_tensors[1..].to_vec();
    let mut op = ElementwiseOperation::new(
        "add",
        def,
        vec![Stmt::Let(FRAGMENT_OUTPUT.to_string(), value)],
    );
    for (i, desc) in extra.into_iter().enumerate() {
        op.gpu_op_mut()
            .add_src_tensor(format!("src_tensor_{}", i + 1), desc);
    }
    op.set_linkable(uniform);
    Ok(op)
}
