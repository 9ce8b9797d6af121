use crate::gpu::wgsl::render_kernel;
use crate::{
    merge_operations, AccessType, Argument, ArgumentError, Arguments, BufferDescriptor,
    CommandQueue, CompiledKernel, CompilerOption, ComputeDevice, DType, Dispatch, ElementwiseId,
    ElementwisePool, InvariantError, KernelBody, KernelBuildError, KernelSource, Linkable,
    OperationDef, Precision, ProgramCache, QueueError, RVec, Shape, StorageType, Tensor,
    TensorDescriptor, TensorError, TensorHandle, TensorPool, TuningParameters,
};
use glam::UVec3;

/// Work-group used until [`Operation::tune`] picks one.
pub const DEFAULT_WORK_GROUP: UVec3 = UVec3::new(8, 4, 1);

/// Local that carries the value between a host's own computation and the
/// code of its linked operations.
pub const LINKED_VALUE: &str = "in_out_value";

/// Misuse of the operation lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum InvalidStateError {
    #[error("Operation is already compiled")]
    AlreadyCompiled,
    #[error("Operation has not been compiled")]
    NotCompiled,
    #[error("`{op}` is linked into another operation (link index {link_index}) and cannot run on its own")]
    Linked { op: String, link_index: usize },
    #[error("Arguments of `{op}` were handed off to a host operation")]
    ArgumentsTaken { op: String },
    #[error("`{op}` cannot be linked")]
    NotLinkable { op: String },
    #[error("`{op}` is already linked (link index {link_index})")]
    AlreadyLinked { op: String, link_index: usize },
    #[error("Tensor `{name}` has storage {actual:?}, kernel was compiled for {expected:?}")]
    StorageMismatch {
        name: String,
        expected: StorageType,
        actual: StorageType,
    },
    #[error("Tensor `{name}` has dtype {actual:?}, kernel was compiled for {expected:?}")]
    DTypeMismatch {
        name: String,
        expected: DType,
        actual: DType,
    },
    #[error("Tensor `{name}` has rank {rank}, at most 4 is supported")]
    RankTooLarge { name: String, rank: usize },
    #[error("Tensor `{name}` has shape {actual:?}, which does not cover the output {expected:?}")]
    ExtentMismatch {
        name: String,
        expected: Shape,
        actual: Shape,
    },
    #[error("Tensor `{name}` has {actual} channels and is read without a guard, the output has {expected}")]
    ChannelMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("Batch {batch} is not supported by the storage types of `{op}`")]
    BatchNotSupported { op: String, batch: usize },
    #[error("Operation {0:?} is not present in the pool")]
    StaleOperation(ElementwiseId),
}

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("Failed to compile operation: {0}")]
    CompileError(String),
    #[error(transparent)]
    KernelBuildError(#[from] KernelBuildError),
    #[error(transparent)]
    ArgumentError(#[from] ArgumentError),
    #[error("Argument `{name}` is declared by more than one linked operation")]
    MergeConflict { name: String },
    #[error("Failed to dispatch: {0}")]
    DispatchError(#[from] QueueError),
    #[error(transparent)]
    InvalidState(#[from] InvalidStateError),
    #[error(transparent)]
    TensorError(#[from] TensorError),
    #[error(transparent)]
    InvariantError(#[from] InvariantError),
    #[error(transparent)]
    UnknownError(#[from] anyhow::Error),
}

/// Collaborators needed to build kernels.
#[derive(Clone, Copy)]
pub struct CreationContext<'a> {
    pub device: &'a dyn ComputeDevice,
    pub cache: &'a ProgramCache,
}

impl<'a> CreationContext<'a> {
    pub fn new(device: &'a dyn ComputeDevice, cache: &'a ProgramCache) -> Self {
        Self { device, cache }
    }
}

impl std::fmt::Debug for CreationContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreationContext")
            .field("device", &self.device.name())
            .field("cache", &self.cache)
            .finish()
    }
}

/// State shared by every operation: definition, tensor slots, generated code
/// and launch configuration.
///
/// Not `Clone`: an operation owns its kernel and argument set, and hands them
/// off explicitly (see [`Linkable::take_args`]).
#[derive(Debug)]
pub struct GpuOperation {
    definition: OperationDef,
    src: RVec<Option<TensorHandle>>,
    dst: RVec<Option<TensorHandle>>,
    src_tensor_names: RVec<String>,
    dst_tensor_names: RVec<String>,
    pub(crate) args: Arguments,
    pub(crate) body: KernelBody,
    compiler_options: RVec<CompilerOption>,
    kernel: Option<CompiledKernel>,
    work_group_size: UVec3,
    grid_size: UVec3,
    linked_operations: RVec<ElementwiseId>,
    tuned: bool,
    warned_untuned: bool,
}

impl GpuOperation {
    pub fn new(definition: OperationDef) -> Self {
        Self {
            definition,
            src: RVec::new(),
            dst: RVec::new(),
            src_tensor_names: RVec::new(),
            dst_tensor_names: RVec::new(),
            args: Arguments::new(),
            body: KernelBody::default(),
            compiler_options: RVec::new(),
            kernel: None,
            work_group_size: DEFAULT_WORK_GROUP,
            grid_size: UVec3::ONE,
            linked_operations: RVec::new(),
            tuned: false,
            warned_untuned: false,
        }
    }

    pub fn definition(&self) -> &OperationDef {
        &self.definition
    }

    pub fn precision(&self) -> Precision {
        self.definition.precision
    }

    /// Declares a source tensor slot. The n-th call names source `n`.
    pub fn add_src_tensor(&mut self, name: impl Into<String>, descriptor: TensorDescriptor) {
        let name = name.into();
        self.args.add_tensor(name.clone(), descriptor, AccessType::Read);
        self.src_tensor_names.push(name);
    }

    /// Declares a destination tensor slot. The n-th call names destination `n`.
    pub fn add_dst_tensor(&mut self, name: impl Into<String>, descriptor: TensorDescriptor) {
        let name = name.into();
        self.args.add_tensor(name.clone(), descriptor, AccessType::Write);
        self.dst_tensor_names.push(name);
    }

    pub fn add_src_buffer(&mut self, name: impl Into<String>, descriptor: BufferDescriptor) {
        self.args.add_buffer(name, descriptor);
    }

    pub fn args(&self) -> &Arguments {
        &self.args
    }

    pub fn args_mut(&mut self) -> &mut Arguments {
        &mut self.args
    }

    pub fn body(&self) -> &KernelBody {
        &self.body
    }

    pub fn set_body(&mut self, body: KernelBody) {
        self.body = body;
    }

    pub fn add_compiler_option(&mut self, option: CompilerOption) {
        if !self.compiler_options.contains(&option) {
            self.compiler_options.push(option);
        }
    }

    pub fn src_tensor_names(&self) -> &[String] {
        &self.src_tensor_names
    }

    pub fn dst_tensor_names(&self) -> &[String] {
        &self.dst_tensor_names
    }

    pub fn src(&self) -> &[Option<TensorHandle>] {
        &self.src
    }

    pub fn dst(&self) -> &[Option<TensorHandle>] {
        &self.dst
    }

    pub fn set_src(&mut self, handle: TensorHandle, index: usize) {
        set_slot(&mut self.src, handle, index);
    }

    pub fn set_dst(&mut self, handle: TensorHandle, index: usize) {
        set_slot(&mut self.dst, handle, index);
    }

    /// Resolves destination `index` in `tensors`.
    pub fn dst_tensor<'t>(
        &self,
        index: usize,
        tensors: &'t TensorPool,
    ) -> Result<&'t Tensor, OperationError> {
        let handle = self.dst.get(index).copied().flatten().ok_or_else(|| {
            ArgumentError::Unbound {
                name: self
                    .dst_tensor_names
                    .get(index)
                    .cloned()
                    .unwrap_or_else(|| format!("dst[{index}]")),
            }
        })?;
        Ok(tensors.get(handle)?)
    }

    /// Writes the current tensor handles into the argument set.
    ///
    /// Slots without a handle are left as they are; binding reports them.
    pub fn bind_tensors(&mut self) -> Result<(), ArgumentError> {
        let pairs = self
            .src_tensor_names
            .iter()
            .zip(self.src.iter())
            .chain(self.dst_tensor_names.iter().zip(self.dst.iter()));
        for (name, handle) in pairs {
            if let Some(handle) = handle {
                self.args.set_tensor(name, *handle)?;
            }
        }
        Ok(())
    }

    pub fn kernel(&self) -> Option<&CompiledKernel> {
        self.kernel.as_ref()
    }

    pub fn is_compiled(&self) -> bool {
        self.kernel.is_some()
    }

    pub fn grid_size(&self) -> UVec3 {
        self.grid_size
    }

    pub fn work_group_size(&self) -> UVec3 {
        self.work_group_size
    }

    pub fn is_tuned(&self) -> bool {
        self.tuned
    }

    pub fn linked_operations(&self) -> &[ElementwiseId] {
        &self.linked_operations
    }

    /// Reverts to `args` and points the tensor slots back at its handles.
    fn restore_bindings(&mut self, args: Arguments) {
        self.args = args;
        let slots = self
            .src_tensor_names
            .iter()
            .zip(self.src.iter_mut())
            .chain(self.dst_tensor_names.iter().zip(self.dst.iter_mut()));
        for (name, slot) in slots {
            if let Some(Argument::Tensor(bound)) = self.args.get(name) {
                *slot = bound.handle;
            }
        }
    }

    /// Checks every tensor slot against the descriptor the code was generated
    /// for.
    fn check_tensor_layouts(&self, tensors: &TensorPool) -> Result<(), OperationError> {
        for (name, argument) in self.args.iter() {
            let Argument::Tensor(slot) = argument else {
                continue;
            };
            let Some(handle) = slot.handle else {
                continue;
            };
            let tensor = tensors.get(handle)?;
            let actual = tensor.descriptor();
            if actual.storage_type != slot.descriptor.storage_type {
                return Err(InvalidStateError::StorageMismatch {
                    name: name.to_string(),
                    expected: slot.descriptor.storage_type,
                    actual: actual.storage_type,
                }
                .into());
            }
            if actual.dtype != slot.descriptor.dtype {
                return Err(InvalidStateError::DTypeMismatch {
                    name: name.to_string(),
                    expected: slot.descriptor.dtype,
                    actual: actual.dtype,
                }
                .into());
            }
            if tensor.shape().rank() > 4 {
                return Err(InvalidStateError::RankTooLarge {
                    name: name.to_string(),
                    rank: tensor.shape().rank(),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Binds the current tensors and validates them against the compiled kernel.
fn checked_grid_size<O: Operation + ?Sized>(
    op: &mut O,
    tensors: &TensorPool,
) -> Result<UVec3, OperationError> {
    op.gpu_op_mut().bind_tensors()?;
    op.gpu_op().check_tensor_layouts(tensors)?;
    op.post_compile_check(tensors)?;
    op.grid_size(tensors)
}

fn set_slot(slots: &mut RVec<Option<TensorHandle>>, handle: TensorHandle, index: usize) {
    if slots.len() <= index {
        slots.resize(index + 1, None);
    }
    slots[index] = Some(handle);
}

/// A dispatchable GPU computation.
///
/// Lifecycle: construct, [`add_operation`](Operation::add_operation) any
/// linked elementwise operations, [`compile`](Operation::compile) once,
/// [`tune`](Operation::tune), then [`add_to_queue`](Operation::add_to_queue)
/// per invocation. After compilation, inputs and outputs may be swapped with
/// [`set_src`](Operation::set_src) / [`set_dst`](Operation::set_dst)
/// followed by [`update_params`](Operation::update_params).
pub trait Operation {
    fn name(&self) -> &str;

    fn gpu_op(&self) -> &GpuOperation;

    fn gpu_op_mut(&mut self) -> &mut GpuOperation;

    /// # Grid Size
    ///
    /// Dispatch extent for the current tensors. Every operation defines its
    /// own.
    fn grid_size(&self, tensors: &TensorPool) -> Result<UVec3, OperationError>;

    /// Adds operation-specific arguments before the kernel is built or
    /// dispatched.
    fn bind_arguments(&mut self, _tensors: &TensorPool) -> Result<(), OperationError> {
        Ok(())
    }

    /// Rejects configurations the generated kernel cannot handle.
    fn post_compile_check(&self, _tensors: &TensorPool) -> Result<(), OperationError> {
        Ok(())
    }

    /// Whether the operation may be compiled, tuned or dispatched on its own.
    fn check_dispatchable(&self) -> Result<(), InvalidStateError> {
        Ok(())
    }

    fn set_src(&mut self, handle: TensorHandle, index: usize) {
        self.gpu_op_mut().set_src(handle, index);
    }

    fn set_dst(&mut self, handle: TensorHandle, index: usize) {
        self.gpu_op_mut().set_dst(handle, index);
    }

    /// Links the elementwise operation `id` into this one. Its code runs on
    /// this operation's result before the result is stored.
    fn add_operation(
        &mut self,
        id: ElementwiseId,
        pool: &mut ElementwisePool,
    ) -> Result<(), OperationError> {
        if self.gpu_op().is_compiled() {
            return Err(InvalidStateError::AlreadyCompiled.into());
        }
        let link_index = self.gpu_op().linked_operations.len() + 1;
        let child = pool.get_mut(id)?;
        if !child.is_linkable() {
            return Err(InvalidStateError::NotLinkable {
                op: child.name().to_string(),
            }
            .into());
        }
        if child.link_index() != 0 {
            return Err(InvalidStateError::AlreadyLinked {
                op: child.name().to_string(),
                link_index: child.link_index(),
            }
            .into());
        }
        child.set_link_index(link_index);
        log::trace!("Linked {} into {} at {link_index}", child.name(), self.name());
        self.gpu_op_mut().linked_operations.push(id);
        Ok(())
    }

    /// Merges linked operations, binds arguments and builds the kernel.
    fn compile(
        &mut self,
        ctx: &CreationContext,
        pool: &mut ElementwisePool,
        tensors: &TensorPool,
    ) -> Result<(), OperationError> {
        self.check_dispatchable()?;
        if self.gpu_op().is_compiled() {
            return Err(InvalidStateError::AlreadyCompiled.into());
        }

        let linked = self.gpu_op().linked_operations.clone();
        let op = self.gpu_op_mut();
        if linked.is_empty() {
            op.body.strip_link_point();
        } else {
            let merged = merge_operations(&linked, pool, LINKED_VALUE)?;
            if !op.body.splice_link_point(merged.stmts) {
                return Err(OperationError::CompileError(
                    "kernel has no point to link operations at".to_string(),
                ));
            }
            op.args
                .merge(merged.args)
                .map_err(|name| OperationError::MergeConflict { name })?;
            // Linked sources continue the host's numbering. A handle the
            // caller already set at that index wins over the child's.
            for (name, handle) in merged.srcs {
                let index = op.src_tensor_names.len();
                op.src_tensor_names.push(name);
                if op.src.len() <= index {
                    op.src.resize(index + 1, None);
                }
                if op.src[index].is_none() {
                    op.src[index] = handle;
                }
            }
        }
        op.bind_tensors()?;
        self.bind_arguments(tensors)?;

        let op = self.gpu_op();
        for (name, kind) in op.body.argument_refs() {
            if let Some(expected) = kind.argument_kind() {
                op.args.expect(&name, expected)?;
            }
        }
        op.body
            .check_locals()
            .map_err(OperationError::CompileError)?;
        op.args.bind(tensors)?;
        op.check_tensor_layouts(tensors)?;

        let grid_tensor = op
            .dst_tensor_names
            .first()
            .cloned()
            .ok_or_else(|| OperationError::CompileError("no destination tensor".to_string()))?;
        let precision = op.precision();
        let mut options = op.compiler_options.clone();
        if precision.compute_dtype() == DType::F16 {
            options.push(CompilerOption::Fp16Arithmetic);
        }
        let text = render_kernel(self.name(), &op.args, &op.body, precision, &grid_tensor);
        let source = KernelSource {
            text,
            body: op.body.clone(),
            precision,
            grid_tensor,
        };
        let kernel = ctx
            .cache
            .get_or_build(self.name(), source, &options, ctx.device)?;
        log::debug!("Compiled {} as {}", self.name(), kernel.key());

        let grid_size = self.grid_size(tensors)?;
        let op = self.gpu_op_mut();
        op.kernel = Some(kernel);
        op.grid_size = grid_size;
        op.work_group_size = ctx.device.limits().clamp(DEFAULT_WORK_GROUP);
        self.post_compile_check(tensors)
    }

    /// Recomputes the grid after tensors were swapped post-compilation.
    ///
    /// The new tensors must have the storage type and data type the kernel
    /// was generated for. If they are rejected, the operation keeps the
    /// tensors it was last validated with.
    fn update_params(&mut self, tensors: &TensorPool) -> Result<(), OperationError> {
        if !self.gpu_op().is_compiled() {
            return Err(InvalidStateError::NotCompiled.into());
        }
        let validated = self.gpu_op().args.clone();
        match checked_grid_size(self, tensors) {
            Ok(grid_size) => {
                log::trace!("{} grid is now {grid_size}", self.name());
                self.gpu_op_mut().grid_size = grid_size;
                Ok(())
            }
            Err(e) => {
                log::debug!("Rejected new tensors for {}: {e}", self.name());
                self.gpu_op_mut().restore_bindings(validated);
                Err(e)
            }
        }
    }

    /// Picks a work-group size for the current grid.
    fn tune(
        &mut self,
        params: &TuningParameters,
        tensors: &TensorPool,
    ) -> Result<(), OperationError> {
        self.check_dispatchable()?;
        if !self.gpu_op().is_compiled() {
            return Err(InvalidStateError::NotCompiled.into());
        }
        self.gpu_op_mut().bind_tensors()?;
        self.bind_arguments(tensors)?;
        self.gpu_op().args.bind(tensors)?;

        let grid = self.gpu_op().grid_size;
        let mut work_group = params
            .picker
            .pick(grid, params.limits, params.tuning_type);
        if !params.limits.allows(work_group) {
            log::warn!(
                "Work-group {work_group} picked for {} exceeds device limits, clamping",
                self.name()
            );
            work_group = params.limits.clamp(work_group);
        }
        log::debug!("Tuned {} for grid {grid}: {work_group}", self.name());
        let op = self.gpu_op_mut();
        op.work_group_size = work_group;
        op.tuned = true;
        Ok(())
    }

    /// Binds the current tensors and submits one dispatch.
    fn add_to_queue(
        &mut self,
        queue: &mut dyn CommandQueue,
        tensors: &mut TensorPool,
    ) -> Result<(), OperationError> {
        self.check_dispatchable()?;
        if !self.gpu_op().is_compiled() {
            return Err(InvalidStateError::NotCompiled.into());
        }
        self.gpu_op_mut().bind_tensors().map_err(QueueError::Bind)?;
        self.bind_arguments(tensors)?;

        if !self.gpu_op().tuned && !self.gpu_op().warned_untuned {
            log::warn!(
                "{} dispatched before tuning, using work-group {}",
                self.name(),
                self.gpu_op().work_group_size
            );
            self.gpu_op_mut().warned_untuned = true;
        }

        let op = self.gpu_op();
        let kernel = op.kernel.as_ref().ok_or(InvalidStateError::NotCompiled)?;
        let bound = op.args.bind(tensors).map_err(QueueError::Bind)?;
        log::trace!(
            "Dispatching {} grid {} work-group {}",
            kernel.key(),
            op.grid_size,
            op.work_group_size
        );
        queue.dispatch(
            Dispatch {
                kernel,
                args: &bound,
                grid: op.grid_size,
                work_group: op.work_group_size,
            },
            tensors,
        )?;
        Ok(())
    }
}
