//! Merging of linked elementwise operations into a host kernel.

use crate::{
    Argument, Arguments, ElementwiseId, ElementwisePool, Expr, Linkable,
    OperationError, RVec, Stmt, TensorHandle,
};

/// Postfix given to the operation at 1-based position `index` of a chain.
pub fn link_postfix(index: usize) -> String {
    format!("_link{index}")
}

/// Combined code and arguments of a chain of linked operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedCode {
    pub args: Arguments,
    /// Statements to splice at the host's link point.
    pub stmts: Vec<Stmt>,
    /// Tensors the chain reads besides the host's value, under their
    /// postfixed names.
    pub srcs: RVec<(String, Option<TensorHandle>)>,
}

/// Merges the operations `ids`, in chain order, into code operating on the
/// host local `value`.
///
/// Operation `i` receives link index `i` (1-based) and the postfix
/// [`link_postfix(i)`](link_postfix). Each fragment reads the previous
/// fragment's output; the last output is assigned back to `value`.
/// The arguments of every operation are taken, so a merged operation cannot
/// be dispatched on its own afterwards.
pub fn merge_operations(
    ids: &[ElementwiseId],
    pool: &mut ElementwisePool,
    value: &str,
) -> Result<MergedCode, OperationError> {
    let mut merged = MergedCode::default();
    let mut current = value.to_string();

    for (i, id) in ids.iter().enumerate() {
        let index = i + 1;
        let op = pool.get_mut(*id)?;
        op.set_link_index(index);
        op.add_unique_postfix(&link_postfix(index));

        let fragment = op.fragment();
        let args = op.take_args()?;

        let mut body = fragment.body;
        body.rename_local(&fragment.input, &current);

        for name in fragment.inputs {
            let Some(Argument::Tensor(t)) = args.get(&name) else {
                return Err(OperationError::CompileError(format!(
                    "`{name}` is read by a linked operation but not declared as a tensor"
                )));
            };
            merged.srcs.push((name, t.handle));
        }
        merged
            .args
            .merge(args)
            .map_err(|name| OperationError::MergeConflict { name })?;
        merged.stmts.extend(body.into_stmts());
        current = fragment.output;
    }

    if !ids.is_empty() {
        merged
            .stmts
            .push(Stmt::Assign(value.to_string(), Expr::value(current)));
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{self, ChannelParam};
    use crate::{
        rvec, DType, ElementwiseOperation, KernelBody, OperationDef, Precision, TensorDescriptor,
        UnaryFn, LINKED_VALUE,
    };
    use test_strategy::{proptest, Arbitrary};

    fn def() -> OperationDef {
        OperationDef::unary(Precision::F32, TensorDescriptor::buffer(DType::F32))
    }

    #[derive(Arbitrary, Debug, Clone, Copy)]
    enum ChainOp {
        Relu,
        Clamp,
        Sigmoid,
        Scale,
    }

    impl ChainOp {
        fn build(self) -> ElementwiseOperation {
            match self {
                ChainOp::Relu => ops::relu(def(), 0.1, Some(6.)),
                ChainOp::Clamp => ops::clamp(def(), -1., 1.),
                ChainOp::Sigmoid => ops::unary(def(), UnaryFn::Sigmoid),
                ChainOp::Scale => ops::multiply_add(
                    def(),
                    ChannelParam::PerChannel(vec![1., 2., 3.]),
                    ChannelParam::Scalar(0.5),
                ),
            }
            .unwrap()
        }
    }

    fn host_body(merged: &MergedCode) -> KernelBody {
        let mut body = KernelBody::new(vec![
            Stmt::Var(LINKED_VALUE.into(), Expr::read("src_tensor")),
            Stmt::LinkPoint,
            Stmt::Store("dst_tensor".into(), Expr::value(LINKED_VALUE)),
        ]);
        assert!(body.splice_link_point(merged.stmts.clone()));
        body
    }

    fn merge_chain(chain: &[ChainOp]) -> MergedCode {
        let mut pool = ElementwisePool::new();
        let ids: Vec<_> = chain.iter().map(|op| pool.insert(op.build())).collect();
        merge_operations(&ids, &mut pool, LINKED_VALUE).unwrap()
    }

    #[test]
    fn test_merge_is_deterministic() {
        let chain = [ChainOp::Scale, ChainOp::Relu, ChainOp::Scale];
        let a = merge_chain(&chain);
        let b = merge_chain(&chain);
        assert_eq!(a, b);
        assert_eq!(host_body(&a).to_string(), host_body(&b).to_string());
    }

    #[test]
    fn test_merge_threads_values() {
        let merged = merge_chain(&[ChainOp::Sigmoid, ChainOp::Clamp]);
        assert_eq!(
            merged.stmts.first(),
            Some(&Stmt::Let(
                "out_value_link1".into(),
                Expr::unary(UnaryFn::Sigmoid, Expr::value(LINKED_VALUE))
            ))
        );
        assert_eq!(
            merged.stmts.last(),
            Some(&Stmt::Assign(
                LINKED_VALUE.into(),
                Expr::value("out_value_link2")
            ))
        );
    }

    #[test]
    fn test_merged_operations_are_consumed() {
        let mut pool = ElementwisePool::new();
        let id = pool.insert(ChainOp::Relu.build());
        merge_operations(&[id], &mut pool, LINKED_VALUE).unwrap();
        let op = pool.get(id).unwrap();
        assert_eq!(op.link_index(), 1);
        assert!(merge_operations(&[id], &mut pool, LINKED_VALUE).is_err());
    }

    #[test]
    fn test_merged_sources_follow_reads() {
        let desc = TensorDescriptor::buffer(DType::F32);
        let add_def = OperationDef::new(Precision::F32, rvec![desc, desc, desc], rvec![desc]);
        let mut pool = ElementwisePool::new();
        let ids = [
            pool.insert(ChainOp::Relu.build()),
            pool.insert(ops::add(add_def, &[4, 4, 4]).unwrap()),
        ];
        let merged = merge_operations(&ids, &mut pool, LINKED_VALUE).unwrap();
        let names: Vec<_> = merged.srcs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["src_tensor_1_link2", "src_tensor_2_link2"]);
        assert!(merged.srcs.iter().all(|(_, handle)| handle.is_none()));
    }

    #[test]
    fn test_empty_chain() {
        let merged = merge_chain(&[]);
        assert!(merged.stmts.is_empty());
        assert!(merged.args.is_empty());
    }

    #[proptest(cases = 64)]
    fn test_chains_never_collide(
        #[strategy(proptest::collection::vec(proptest::arbitrary::any::<ChainOp>(), 1..12))]
        chain: Vec<ChainOp>,
    ) {
        let merged = merge_chain(&chain);
        let names: Vec<_> = merged.args.names().collect();
        let mut unique = names.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(names.len(), unique.len());
        host_body(&merged).check_locals().unwrap();
    }
}
