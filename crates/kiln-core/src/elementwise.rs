use crate::{
    Argument, Arguments, Expr, GpuOperation, InvalidStateError, KernelBody, Operation,
    OperationDef, OperationError, Shape, Stmt, TensorArgument, TensorPool, LINKED_VALUE,
};
use glam::UVec3;
use slotmap::{new_key_type, SlotMap};

/// Local an elementwise fragment reads its input from.
pub const FRAGMENT_INPUT: &str = "in_value";
/// Local an elementwise fragment leaves its result in.
pub const FRAGMENT_OUTPUT: &str = "out_value";

new_key_type! {
    /// Non-owning reference to an operation living in an [`ElementwisePool`].
    pub struct ElementwiseId;
}

/// Caller-owned arena of elementwise operations that may be linked into
/// hosts.
#[derive(Debug, Default)]
pub struct ElementwisePool {
    ops: SlotMap<ElementwiseId, ElementwiseOperation>,
}

impl ElementwisePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, op: ElementwiseOperation) -> ElementwiseId {
        self.ops.insert(op)
    }

    pub fn remove(&mut self, id: ElementwiseId) -> Option<ElementwiseOperation> {
        self.ops.remove(id)
    }

    pub fn get(&self, id: ElementwiseId) -> Result<&ElementwiseOperation, InvalidStateError> {
        self.ops.get(id).ok_or(InvalidStateError::StaleOperation(id))
    }

    pub fn get_mut(
        &mut self,
        id: ElementwiseId,
    ) -> Result<&mut ElementwiseOperation, InvalidStateError> {
        self.ops
            .get_mut(id)
            .ok_or(InvalidStateError::StaleOperation(id))
    }

    pub fn contains(&self, id: ElementwiseId) -> bool {
        self.ops.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Code of an elementwise operation, ready to be inlined into a host.
///
/// `body` reads the local `input` and defines the local `output`.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub body: KernelBody,
    pub input: String,
    pub output: String,
    /// Tensors `body` reads besides `input`, in first-use order.
    pub inputs: Vec<String>,
}

/// The capability to be merged into another operation's kernel.
pub trait Linkable {
    fn is_linkable(&self) -> bool;

    /// 0 while unlinked, otherwise the 1-based position in the host's chain.
    fn link_index(&self) -> usize;

    fn set_link_index(&mut self, index: usize);

    /// Appends `postfix` to every name of the fragment and of the taken
    /// arguments. A later call replaces the previous postfix.
    fn add_unique_postfix(&mut self, postfix: &str);

    fn fragment(&self) -> Fragment;

    /// Hands the operation's arguments over, without the primary source and
    /// destination which the host provides. Tensors already set on the
    /// operation stay bound. The operation cannot be dispatched afterwards.
    fn take_args(&mut self) -> Result<Arguments, OperationError>;
}

/// An operation whose output element depends only on the input elements at
/// the same coordinate.
///
/// Runs standalone as one thread per output slice, or links into a host
/// through [`Linkable`].
#[derive(Debug)]
pub struct ElementwiseOperation {
    name: String,
    op: GpuOperation,
    code: KernelBody,
    linkable: bool,
    link_index: usize,
    postfix: Option<String>,
    args_taken: bool,
}

impl ElementwiseOperation {
    /// `code` reads [`FRAGMENT_INPUT`] and defines [`FRAGMENT_OUTPUT`]. Extra
    /// sources, buffers and scalars are declared on the returned operation.
    pub fn new(name: impl Into<String>, definition: OperationDef, code: Vec<Stmt>) -> Self {
        let mut op = GpuOperation::new(definition.clone());
        if let Some(desc) = definition.src_tensors.first() {
            op.add_src_tensor("src_tensor", *desc);
        }
        if let Some(desc) = definition.dst_tensors.first() {
            op.add_dst_tensor("dst_tensor", *desc);
        }
        let code = KernelBody::new(code);

        let mut body = KernelBody::new(vec![Stmt::Let(
            FRAGMENT_INPUT.to_string(),
            Expr::read("src_tensor"),
        )]);
        body.extend(code.stmts().iter().cloned());
        body.extend([
            Stmt::Var(LINKED_VALUE.to_string(), Expr::value(FRAGMENT_OUTPUT)),
            Stmt::LinkPoint,
            Stmt::Store("dst_tensor".to_string(), Expr::value(LINKED_VALUE)),
        ]);
        op.set_body(body);

        Self {
            name: name.into(),
            op,
            code,
            linkable: true,
            link_index: 0,
            postfix: None,
            args_taken: false,
        }
    }

    pub fn set_linkable(&mut self, linkable: bool) {
        self.linkable = linkable;
    }

    pub fn code(&self) -> &KernelBody {
        &self.code
    }

    fn postfix(&self) -> &str {
        self.postfix.as_deref().unwrap_or("")
    }
}

impl Linkable for ElementwiseOperation {
    fn is_linkable(&self) -> bool {
        self.linkable
    }

    fn link_index(&self) -> usize {
        self.link_index
    }

    fn set_link_index(&mut self, index: usize) {
        self.link_index = index;
    }

    fn add_unique_postfix(&mut self, postfix: &str) {
        self.postfix = Some(postfix.to_string());
    }

    fn fragment(&self) -> Fragment {
        let mut body = self.code.clone();
        body.add_postfix(self.postfix());
        let inputs = body
            .tensor_reads()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        Fragment {
            body,
            inputs,
            input: format!("{FRAGMENT_INPUT}{}", self.postfix()),
            output: format!("{FRAGMENT_OUTPUT}{}", self.postfix()),
        }
    }

    fn take_args(&mut self) -> Result<Arguments, OperationError> {
        if self.args_taken {
            return Err(InvalidStateError::ArgumentsTaken {
                op: self.name.clone(),
            }
            .into());
        }
        self.op.bind_tensors()?;
        let mut args = std::mem::take(&mut self.op.args);
        self.args_taken = true;
        args.remove("src_tensor");
        args.remove("dst_tensor");
        Ok(args.with_postfix(self.postfix()))
    }
}

impl Operation for ElementwiseOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn gpu_op(&self) -> &GpuOperation {
        &self.op
    }

    fn gpu_op_mut(&mut self) -> &mut GpuOperation {
        &mut self.op
    }

    fn grid_size(&self, tensors: &TensorPool) -> Result<UVec3, OperationError> {
        let shape = self.op.dst_tensor(0, tensors)?.shape();
        Ok(UVec3::new(
            (shape.width() * shape.batch()) as u32,
            shape.height() as u32,
            shape.slices() as u32,
        ))
    }

    fn post_compile_check(&self, tensors: &TensorPool) -> Result<(), OperationError> {
        let expected = self.op.dst_tensor(0, tensors)?.shape();
        let batch = expected.batch();
        if batch > 1 && !self.op.definition().is_batch_supported() {
            return Err(InvalidStateError::BatchNotSupported {
                op: self.name.clone(),
                batch,
            }
            .into());
        }
        // Every thread reads each source at its own coordinate, so sources
        // must match the output extent. Guarded reads may differ in channels.
        for (name, guarded) in self.op.body().tensor_reads() {
            let Some(Argument::Tensor(TensorArgument {
                handle: Some(handle),
                ..
            })) = self.op.args().get(&name)
            else {
                continue;
            };
            let actual = tensors.get(*handle)?.shape();
            let extent = |s: &Shape| (s.batch(), s.height(), s.width());
            if extent(actual) != extent(expected) {
                return Err(InvalidStateError::ExtentMismatch {
                    name,
                    expected: expected.clone(),
                    actual: actual.clone(),
                }
                .into());
            }
            if !guarded && actual.channels() != expected.channels() {
                return Err(InvalidStateError::ChannelMismatch {
                    name,
                    expected: expected.channels(),
                    actual: actual.channels(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn check_dispatchable(&self) -> Result<(), InvalidStateError> {
        if self.link_index != 0 {
            return Err(InvalidStateError::Linked {
                op: self.name.clone(),
                link_index: self.link_index,
            });
        }
        if self.args_taken {
            return Err(InvalidStateError::ArgumentsTaken {
                op: self.name.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{rvec, BinaryFn, DType, Precision, TensorDescriptor};

    fn scale_op() -> ElementwiseOperation {
        let def = OperationDef::unary(Precision::F32, TensorDescriptor::buffer(DType::F32));
        let mut op = ElementwiseOperation::new(
            "scale",
            def,
            vec![Stmt::Let(
                FRAGMENT_OUTPUT.into(),
                Expr::binary(BinaryFn::Mul, Expr::value(FRAGMENT_INPUT), Expr::scalar("factor")),
            )],
        );
        op.gpu_op_mut().args_mut().add_float("factor", 2.);
        op
    }

    #[test]
    fn test_standalone_body() {
        let op = scale_op();
        let body = op.gpu_op().body();
        assert!(body.has_link_point());
        assert!(body.check_locals().is_ok());
        assert_eq!(op.gpu_op().src_tensor_names(), &["src_tensor".to_string()]);
    }

    #[test]
    fn test_postfix_is_idempotent() {
        let mut op = scale_op();
        op.add_unique_postfix("_link1");
        let first = op.fragment();
        op.add_unique_postfix("_link1");
        assert_eq!(op.fragment(), first);
        assert_eq!(first.input, "in_value_link1");
        assert_eq!(first.output, "out_value_link1");
        assert_eq!(first.body.locals(), vec!["out_value_link1"]);
    }

    #[test]
    fn test_fragment_inputs() {
        assert!(scale_op().fragment().inputs.is_empty());

        let desc = TensorDescriptor::buffer(DType::F32);
        let def = OperationDef::new(Precision::F32, rvec![desc, desc, desc], rvec![desc]);
        let mut op = crate::ops::add(def, &[4, 4, 4]).unwrap();
        op.add_unique_postfix("_link2");
        assert_eq!(
            op.fragment().inputs,
            vec!["src_tensor_1_link2", "src_tensor_2_link2"]
        );
    }

    #[test]
    fn test_take_args_is_a_move() {
        let mut op = scale_op();
        op.add_unique_postfix("_link3");
        let args = op.take_args().unwrap();
        assert_eq!(args.names().collect::<Vec<_>>(), vec!["factor_link3"]);
        assert!(op.gpu_op().args().is_empty());
        assert!(matches!(
            op.take_args(),
            Err(OperationError::InvalidState(
                InvalidStateError::ArgumentsTaken { .. }
            ))
        ));
        assert!(matches!(
            op.check_dispatchable(),
            Err(InvalidStateError::ArgumentsTaken { .. })
        ));
    }

    #[test]
    fn test_stale_operation() {
        let mut pool = ElementwisePool::new();
        let id = pool.insert(scale_op());
        assert!(pool.get(id).is_ok());
        pool.remove(id);
        assert!(matches!(
            pool.get(id),
            Err(InvalidStateError::StaleOperation(_))
        ));
    }
}
