use glam::UVec3;
use kiln::ops::{self, ChannelParam};
use kiln::test_utils::{all_close, map_tensors, rand_tensor, test_rng, tolerance, Harness};
use kiln::{
    rvec, shape, DType, ElementwiseOperation, InvalidStateError, Linkable, Operation,
    OperationDef, OperationError, Precision, QueueError, StorageType, Tensor, TensorDescriptor,
    UnaryFn, DEFAULT_WORK_GROUP,
};
use test_strategy::{proptest, Arbitrary};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn unary_def(precision: Precision) -> OperationDef {
    OperationDef::unary(
        precision,
        TensorDescriptor::buffer(precision.storage_dtype()),
    )
}

fn add_def(precision: Precision) -> OperationDef {
    let desc = TensorDescriptor::buffer(precision.storage_dtype());
    OperationDef::new(precision, rvec![desc, desc], rvec![desc])
}

#[test]
fn test_fused_add_clamp_single_dispatch() -> anyhow::Result<()> {
    init_logger();
    let precision = Precision::F16;
    let desc = TensorDescriptor::buffer(DType::F16);
    let mut rng = test_rng();
    let a = rand_tensor(shape![1, 8, 8, 4], desc, -1., 1.5, &mut rng)?;
    let b = rand_tensor(shape![1, 8, 8, 4], desc, -1., 1.5, &mut rng)?;
    let ground = map_tensors(&[&a, &b], desc, |x| (x[0] + x[1]).clamp(0., 1.))?;

    let mut h = Harness::new();
    let mut host = ops::add(add_def(precision), &[4, 4])?;
    let clamp = h.ops.insert(ops::clamp(unary_def(precision), 0., 1.)?);
    host.add_operation(clamp, &mut h.ops)?;

    let a = h.tensors.insert(a);
    let b = h.tensors.insert(b);
    let dst = h.tensors.insert(Tensor::zeros(shape![1, 8, 8, 4], desc));
    host.set_src(a, 0);
    host.set_src(b, 1);
    host.set_dst(dst, 0);
    h.run(&mut host)?;

    assert_eq!(h.queue.dispatch_count(), 1);
    let (atol, rtol) = tolerance(precision);
    all_close(h.tensors.get(dst)?, &ground, atol, rtol)
}

/// Builds relu -> sigmoid -> scale, the same chain every call.
fn chain(precision: Precision) -> anyhow::Result<Vec<ElementwiseOperation>> {
    Ok(vec![
        ops::relu(unary_def(precision), 0.2, Some(3.))?,
        ops::unary(unary_def(precision), UnaryFn::Sigmoid)?,
        ops::multiply_add(
            unary_def(precision),
            ChannelParam::PerChannel(vec![1., -2., 0.5, 4., 1.5]),
            ChannelParam::Scalar(0.25),
        )?,
    ])
}

fn run_standalone_vs_fused(precision: Precision) -> anyhow::Result<()> {
    let desc = TensorDescriptor::buffer(precision.storage_dtype());
    let s = shape![2, 5, 3, 5];
    let input = rand_tensor(s.clone(), desc, -3., 3., &mut test_rng())?;

    // Standalone: one dispatch per operation, intermediates stored.
    let mut standalone = Harness::new();
    let mut current = standalone.tensors.insert(input.clone());
    let mut host = ops::unary(unary_def(precision), UnaryFn::Neg)?;
    let mut all = chain(precision)?;
    for op in std::iter::once(&mut host).chain(all.iter_mut()) {
        let next = standalone.tensors.insert(Tensor::zeros(s.clone(), desc));
        op.set_src(current, 0);
        op.set_dst(next, 0);
        standalone.run(op)?;
        current = next;
    }
    assert_eq!(standalone.queue.dispatch_count(), 4);
    let expected = standalone.tensors.get(current)?.clone();

    // Fused: the chain linked into the host.
    let mut fused = Harness::new();
    let mut host = ops::unary(unary_def(precision), UnaryFn::Neg)?;
    for op in chain(precision)? {
        let id = fused.ops.insert(op);
        host.add_operation(id, &mut fused.ops)?;
    }
    let src = fused.tensors.insert(input);
    let dst = fused.tensors.insert(Tensor::zeros(s, desc));
    host.set_src(src, 0);
    host.set_dst(dst, 0);
    fused.run(&mut host)?;
    assert_eq!(fused.queue.dispatch_count(), 1);

    let (atol, rtol) = tolerance(precision);
    all_close(fused.tensors.get(dst)?, &expected, atol, rtol)
}

#[test]
fn test_fused_matches_standalone() -> anyhow::Result<()> {
    init_logger();
    for precision in [Precision::F32, Precision::F32F16, Precision::F16] {
        run_standalone_vs_fused(precision)?;
    }
    Ok(())
}

#[test]
fn test_linked_operation_cannot_run_alone() -> anyhow::Result<()> {
    init_logger();
    let mut h = Harness::new();
    let mut host = ops::unary(unary_def(Precision::F32), UnaryFn::Abs)?;
    let id = h.ops.insert(ops::relu(unary_def(Precision::F32), 0., None)?);
    host.add_operation(id, &mut h.ops)?;

    let desc = TensorDescriptor::buffer(DType::F32);
    let src = h.tensors.insert(Tensor::zeros(shape![1, 2, 2, 4], desc));
    let dst = h.tensors.insert(Tensor::zeros(shape![1, 2, 2, 4], desc));

    let mut child = h.ops.remove(id).ok_or_else(|| anyhow::anyhow!("missing child"))?;
    assert_eq!(child.link_index(), 1);
    child.set_src(src, 0);
    child.set_dst(dst, 0);
    let err = h.compile(&mut child).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<OperationError>(),
        Some(OperationError::InvalidState(InvalidStateError::Linked {
            link_index: 1,
            ..
        }))
    ));
    let err = child.add_to_queue(&mut h.queue, &mut h.tensors).unwrap_err();
    assert!(matches!(
        err,
        OperationError::InvalidState(InvalidStateError::Linked { .. })
    ));
    assert_eq!(h.queue.dispatch_count(), 0);
    Ok(())
}

#[test]
fn test_link_preconditions() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let mut host = ops::unary(unary_def(Precision::F32), UnaryFn::Exp)?;

    let uneven = h.ops.insert(ops::add(add_def(Precision::F32), &[4, 2])?);
    assert!(matches!(
        host.add_operation(uneven, &mut h.ops),
        Err(OperationError::InvalidState(InvalidStateError::NotLinkable { .. }))
    ));

    let relu = h.ops.insert(ops::relu(unary_def(Precision::F32), 0., None)?);
    host.add_operation(relu, &mut h.ops)?;
    let mut other = ops::unary(unary_def(Precision::F32), UnaryFn::Sin)?;
    assert!(matches!(
        other.add_operation(relu, &mut h.ops),
        Err(OperationError::InvalidState(InvalidStateError::AlreadyLinked { .. }))
    ));

    let stale = h.ops.insert(ops::relu(unary_def(Precision::F32), 0., None)?);
    h.ops.remove(stale);
    assert!(matches!(
        host.add_operation(stale, &mut h.ops),
        Err(OperationError::InvalidState(InvalidStateError::StaleOperation(_)))
    ));

    let desc = TensorDescriptor::buffer(DType::F32);
    let src = h.tensors.insert(Tensor::zeros(shape![1, 2, 2, 4], desc));
    let dst = h.tensors.insert(Tensor::zeros(shape![1, 2, 2, 4], desc));
    host.set_src(src, 0);
    host.set_dst(dst, 0);
    h.compile(&mut host)?;

    let late = h.ops.insert(ops::relu(unary_def(Precision::F32), 0., None)?);
    assert!(matches!(
        host.add_operation(late, &mut h.ops),
        Err(OperationError::InvalidState(InvalidStateError::AlreadyCompiled))
    ));
    Ok(())
}

#[test]
fn test_update_params() -> anyhow::Result<()> {
    init_logger();
    let desc = TensorDescriptor::buffer(DType::F32);
    let mut h = Harness::new();
    let mut op = ops::unary(unary_def(Precision::F32), UnaryFn::Square)?;
    let src = h.tensors.insert(Tensor::zeros(shape![1, 8, 8, 4], desc));
    let dst = h.tensors.insert(Tensor::zeros(shape![1, 8, 8, 4], desc));
    op.set_src(src, 0);
    op.set_dst(dst, 0);
    h.compile(&mut op)?;
    assert_eq!(op.gpu_op().grid_size(), UVec3::new(8, 8, 1));

    let mut rng = test_rng();
    let new_src = h
        .tensors
        .insert(rand_tensor(shape![3, 4, 6, 9], desc, -2., 2., &mut rng)?);
    let new_dst = h.tensors.insert(Tensor::zeros(shape![3, 4, 6, 9], desc));
    op.set_src(new_src, 0);
    op.set_dst(new_dst, 0);
    op.update_params(&h.tensors)?;
    assert_eq!(op.gpu_op().grid_size(), UVec3::new(18, 4, 3));

    h.tune(&mut op)?;
    h.dispatch(&mut op)?;
    let ground = map_tensors(&[h.tensors.get(new_src)?], desc, |x| x[0] * x[0])?;
    all_close(h.tensors.get(new_dst)?, &ground, 1e-6, 1e-6)?;

    let texture = h.tensors.insert(Tensor::zeros(
        shape![3, 4, 6, 9],
        TensorDescriptor::new(DType::F32, StorageType::Texture2D),
    ));
    op.set_dst(texture, 0);
    assert!(matches!(
        op.update_params(&h.tensors),
        Err(OperationError::InvalidState(InvalidStateError::StorageMismatch { .. }))
    ));

    // The rejected texture is not bound, dispatches keep the last good output.
    assert_eq!(op.gpu_op().dst(), &[Some(new_dst)]);
    *h.tensors.get_mut(new_dst)? = Tensor::zeros(shape![3, 4, 6, 9], desc);
    h.dispatch(&mut op)?;
    all_close(h.tensors.get(new_dst)?, &ground, 1e-6, 1e-6)?;
    assert!(h.tensors.get(texture)?.data().iter().all(|v| *v == 0.));
    Ok(())
}

#[test]
fn test_sources_must_cover_output() -> anyhow::Result<()> {
    init_logger();
    let desc = TensorDescriptor::buffer(DType::F32);
    let mut h = Harness::new();
    let mut op = ops::unary(unary_def(Precision::F32), UnaryFn::Neg)?;
    let src = h.tensors.insert(Tensor::zeros(shape![1, 8, 8, 4], desc));
    let dst = h.tensors.insert(Tensor::zeros(shape![1, 8, 8, 4], desc));
    op.set_src(src, 0);
    op.set_dst(dst, 0);
    h.compile(&mut op)?;

    let small = h
        .tensors
        .insert(rand_tensor(shape![1, 2, 2, 4], desc, -1., 1., &mut test_rng())?);
    op.set_src(small, 0);
    assert!(matches!(
        op.update_params(&h.tensors),
        Err(OperationError::InvalidState(InvalidStateError::ExtentMismatch { .. }))
    ));
    assert_eq!(op.gpu_op().src(), &[Some(src)]);
    h.dispatch(&mut op)?;

    // Skipping the update leaves a grid the source cannot cover.
    op.set_src(small, 0);
    assert!(matches!(
        op.add_to_queue(&mut h.queue, &mut h.tensors),
        Err(OperationError::DispatchError(QueueError::Submit(_)))
    ));
    assert_eq!(h.queue.dispatch_count(), 1);

    let mut fresh = ops::unary(unary_def(Precision::F32), UnaryFn::Neg)?;
    fresh.set_src(small, 0);
    fresh.set_dst(dst, 0);
    let err = h.compile(&mut fresh).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<OperationError>(),
        Some(OperationError::InvalidState(InvalidStateError::ExtentMismatch { .. }))
    ));
    Ok(())
}

#[test]
fn test_update_params_requires_compile() -> anyhow::Result<()> {
    let h = Harness::new();
    let mut op = ops::unary(unary_def(Precision::F32), UnaryFn::Square)?;
    assert!(matches!(
        op.update_params(&h.tensors),
        Err(OperationError::InvalidState(InvalidStateError::NotCompiled))
    ));
    Ok(())
}

#[test]
fn test_secondary_inputs_of_linked_add() -> anyhow::Result<()> {
    init_logger();
    let desc = TensorDescriptor::buffer(DType::F32);
    let s = shape![1, 4, 4, 6];
    let mut rng = test_rng();
    let x = rand_tensor(s.clone(), desc, -1., 1., &mut rng)?;
    let y = rand_tensor(s.clone(), desc, -1., 1., &mut rng)?;
    let z = rand_tensor(s.clone(), desc, -1., 1., &mut rng)?;

    let mut h = Harness::new();
    let xh = h.tensors.insert(x.clone());
    let yh = h.tensors.insert(y.clone());
    let zh = h.tensors.insert(z.clone());
    let dst = h.tensors.insert(Tensor::zeros(s.clone(), desc));

    let mut host = ops::unary(unary_def(Precision::F32), UnaryFn::Abs)?;
    let mut add = ops::add(add_def(Precision::F32), &[6, 6])?;
    add.set_src(yh, 1);
    let add = h.ops.insert(add);
    host.add_operation(add, &mut h.ops)?;
    host.set_src(xh, 0);
    host.set_dst(dst, 0);
    h.run(&mut host)?;

    assert_eq!(
        host.gpu_op().src_tensor_names(),
        &["src_tensor".to_string(), "src_tensor_1_link1".to_string()]
    );
    let ground = map_tensors(&[&x, &y], desc, |v| v[0].abs() + v[1])?;
    all_close(h.tensors.get(dst)?, &ground, 1e-6, 1e-6)?;

    // The linked add's input is the host's source 1.
    host.set_src(zh, 1);
    host.update_params(&h.tensors)?;
    h.dispatch(&mut host)?;
    let ground = map_tensors(&[&x, &z], desc, |v| v[0].abs() + v[1])?;
    all_close(h.tensors.get(dst)?, &ground, 1e-6, 1e-6)
}

#[test]
fn test_pre_tune_dispatch_uses_default_work_group() -> anyhow::Result<()> {
    init_logger();
    let desc = TensorDescriptor::buffer(DType::F32);
    let mut h = Harness::new();
    let mut op = ops::relu(unary_def(Precision::F32), 0., Some(1.))?;
    let src = h.tensors.insert(Tensor::zeros(shape![1, 9, 13, 5], desc));
    let dst = h.tensors.insert(Tensor::zeros(shape![1, 9, 13, 5], desc));
    op.set_src(src, 0);
    op.set_dst(dst, 0);
    h.compile(&mut op)?;
    h.dispatch(&mut op)?;
    h.dispatch(&mut op)?;
    assert_eq!(h.queue.records()[0].work_group, DEFAULT_WORK_GROUP);
    assert!(!op.gpu_op().is_tuned());
    Ok(())
}

#[test]
fn test_stale_tensor_fails_dispatch() -> anyhow::Result<()> {
    let desc = TensorDescriptor::buffer(DType::F32);
    let mut h = Harness::new();
    let mut op = ops::unary(unary_def(Precision::F32), UnaryFn::Tanh)?;
    let src = h.tensors.insert(Tensor::zeros(shape![1, 2, 2, 4], desc));
    let dst = h.tensors.insert(Tensor::zeros(shape![1, 2, 2, 4], desc));
    op.set_src(src, 0);
    op.set_dst(dst, 0);
    h.compile(&mut op)?;
    h.tensors.remove(src);
    assert!(matches!(
        op.add_to_queue(&mut h.queue, &mut h.tensors),
        Err(OperationError::DispatchError(QueueError::Bind(_)))
    ));
    Ok(())
}

#[test]
fn test_unbound_tensor_fails_compile() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let mut op = ops::unary(unary_def(Precision::F32), UnaryFn::Tanh)?;
    let err = h.compile(&mut op).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<OperationError>(),
        Some(OperationError::ArgumentError(_))
    ));
    Ok(())
}

#[test]
fn test_batch_needs_supporting_storage() -> anyhow::Result<()> {
    let desc = TensorDescriptor::new(DType::F32, StorageType::SingleTexture2D);
    let mut h = Harness::new();
    let mut op = ops::unary(OperationDef::unary(Precision::F32, desc), UnaryFn::Abs)?;
    let src = h.tensors.insert(Tensor::zeros(shape![2, 2, 2, 4], desc));
    let dst = h.tensors.insert(Tensor::zeros(shape![2, 2, 2, 4], desc));
    op.set_src(src, 0);
    op.set_dst(dst, 0);
    let err = h.compile(&mut op).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<OperationError>(),
        Some(OperationError::InvalidState(
            InvalidStateError::BatchNotSupported { batch: 2, .. }
        ))
    ));
    Ok(())
}

#[derive(Arbitrary, Debug)]
struct TuneProblem {
    #[strategy(1..=2usize)]
    b: usize,
    #[strategy(1..=300usize)]
    h: usize,
    #[strategy(1..=300usize)]
    w: usize,
    #[strategy(1..=16usize)]
    c: usize,
}

#[proptest(cases = 32)]
fn test_tune_respects_invocation_limit(prob: TuneProblem) {
    let TuneProblem { b, h: height, w, c } = prob;
    let desc = TensorDescriptor::buffer(DType::F32);
    let mut h = Harness::new();
    let mut op = ops::unary(unary_def(Precision::F32), UnaryFn::Abs).unwrap();
    let src = h.tensors.insert(Tensor::zeros(shape![b, height, w, c], desc));
    let dst = h.tensors.insert(Tensor::zeros(shape![b, height, w, c], desc));
    op.set_src(src, 0);
    op.set_dst(dst, 0);
    h.compile(&mut op).unwrap();
    h.tune(&mut op).unwrap();
    let wg = op.gpu_op().work_group_size();
    assert!(wg.x * wg.y * wg.z <= 256);
}
