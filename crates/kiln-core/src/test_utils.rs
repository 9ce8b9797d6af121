//! Helpers shared by unit and integration tests.

use crate::cpu::{CpuDevice, CpuQueue};
use crate::{
    ComputeDevice, CreationContext, DeviceLimits, ElementwisePool, Operation, ProgramCache, Shape,
    Tensor, TensorDescriptor, TensorPool, TuningParameters,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seeded from `KILN_SEED` when set, so failures can be replayed.
pub fn test_rng() -> StdRng {
    if let Some(seed) = std::env::var("KILN_SEED")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
    {
        return StdRng::seed_from_u64(seed);
    }
    StdRng::from_entropy()
}

/// Tensor of uniform values in `[lo, hi)`, rounded to the descriptor's dtype.
pub fn rand_tensor(
    shape: impl Into<Shape>,
    descriptor: TensorDescriptor,
    lo: f32,
    hi: f32,
    rng: &mut StdRng,
) -> anyhow::Result<Tensor> {
    let shape = shape.into();
    let data = (0..shape.numel()).map(|_| rng.gen_range(lo..hi)).collect();
    Ok(Tensor::from_data(data, shape, descriptor)?)
}

/// Applies `f` to every element of `inputs` (which share a shape) and rounds
/// the result to `descriptor`'s dtype.
pub fn map_tensors(
    inputs: &[&Tensor],
    descriptor: TensorDescriptor,
    f: impl Fn(&[f32]) -> f32,
) -> anyhow::Result<Tensor> {
    let Some(first) = inputs.first() else {
        anyhow::bail!("no tensors to map");
    };
    let shape = first.shape().clone();
    if let Some(t) = inputs.iter().find(|t| t.shape() != &shape) {
        anyhow::bail!("Shape mismatch {:?} != {:?}", t.shape(), shape);
    }
    let mut lanes = vec![0.; inputs.len()];
    let data = (0..shape.numel())
        .map(|i| {
            for (lane, t) in lanes.iter_mut().zip(inputs.iter()) {
                *lane = t.data()[i];
            }
            f(&lanes)
        })
        .collect();
    Ok(Tensor::from_data(data, shape, descriptor)?)
}

#[derive(Default)]
struct CloseStats {
    total_error: f32,
    max_abs_error: f32,
    max_abs_error_idx: Option<usize>,
    element_count: usize,
    fail_count: usize,
    atol: f32,
    rtol: f32,
}

impl CloseStats {
    fn new(atol: f32, rtol: f32) -> Self {
        Self {
            atol,
            rtol,
            ..Default::default()
        }
    }

    fn update(&mut self, a: f32, b: f32, index: usize) {
        let abs_diff = (a - b).abs();
        self.total_error += abs_diff;
        self.element_count += 1;

        if abs_diff > self.max_abs_error {
            self.max_abs_error = abs_diff;
            self.max_abs_error_idx = Some(index);
        }

        if !self.is_close(a, b, abs_diff) {
            self.fail_count += 1;
        }
    }

    fn avg_error(&self) -> f32 {
        self.total_error / self.element_count.max(1) as f32
    }

    fn is_close(&self, a: f32, b: f32, abs_diff: f32) -> bool {
        (a.is_nan() && b.is_nan())
            || (a.is_infinite() && b.is_infinite() && a.signum() == b.signum())
            || abs_diff <= self.atol + self.rtol * b.abs()
    }
}

/// Element-wise comparison with absolute and relative tolerance.
pub fn all_close(ours: &Tensor, ground: &Tensor, atol: f32, rtol: f32) -> anyhow::Result<()> {
    if ours.shape() != ground.shape() {
        anyhow::bail!("Shape mismatch {:?} != {:?}", ours.shape(), ground.shape())
    }
    let mut stats = CloseStats::new(atol, rtol);
    for (i, (a, b)) in ours.data().iter().zip(ground.data()).enumerate() {
        stats.update(*a, *b, i);
    }
    if stats.fail_count > 0 {
        anyhow::bail!(
            "{} samples not close - AVGE={} MAE={} at {:?}",
            stats.fail_count,
            stats.avg_error(),
            stats.max_abs_error,
            stats.max_abs_error_idx
        );
    }
    log::trace!(
        "All close - AVGE={} MAE={} at {:?}",
        stats.avg_error(),
        stats.max_abs_error,
        stats.max_abs_error_idx
    );
    Ok(())
}

/// A reference device, queue and the arenas operations run against.
#[derive(Default)]
pub struct Harness {
    pub device: CpuDevice,
    pub cache: ProgramCache,
    pub queue: CpuQueue,
    pub tensors: TensorPool,
    pub ops: ElementwisePool,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits::default())
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            device: CpuDevice::new(limits.clone()),
            cache: ProgramCache::new(),
            queue: CpuQueue::new(limits),
            tensors: TensorPool::new(),
            ops: ElementwisePool::new(),
        }
    }

    pub fn compile(&mut self, op: &mut dyn Operation) -> anyhow::Result<()> {
        let ctx = CreationContext::new(&self.device, &self.cache);
        op.compile(&ctx, &mut self.ops, &self.tensors)?;
        Ok(())
    }

    pub fn tune(&mut self, op: &mut dyn Operation) -> anyhow::Result<()> {
        let limits = self.device.limits().clone();
        op.tune(&TuningParameters::new(&limits), &self.tensors)?;
        Ok(())
    }

    pub fn dispatch(&mut self, op: &mut dyn Operation) -> anyhow::Result<()> {
        op.add_to_queue(&mut self.queue, &mut self.tensors)?;
        Ok(())
    }

    /// Compiles, tunes and dispatches `op` once.
    pub fn run(&mut self, op: &mut dyn Operation) -> anyhow::Result<()> {
        self.compile(op)?;
        self.tune(op)?;
        self.dispatch(op)
    }
}

/// Runs `op` standalone on `inputs` (source 0, 1, ...) into `output` and
/// returns the written output.
pub fn run_elementwise(
    op: &mut crate::ElementwiseOperation,
    inputs: Vec<Tensor>,
    output: Tensor,
) -> anyhow::Result<Tensor> {
    let mut harness = Harness::new();
    for (i, t) in inputs.into_iter().enumerate() {
        let handle = harness.tensors.insert(t);
        op.set_src(handle, i);
    }
    let dst = harness.tensors.insert(output);
    op.set_dst(dst, 0);
    harness.run(op)?;
    anyhow::ensure!(harness.queue.dispatch_count() == 1, "expected one dispatch");
    Ok(harness.tensors.get(dst)?.clone())
}

/// Tolerance matching the arithmetic of `precision`: `(atol, rtol)`.
pub fn tolerance(precision: crate::Precision) -> (f32, f32) {
    match precision {
        crate::Precision::F32 => (1e-5, 1e-5),
        crate::Precision::F32F16 | crate::Precision::F16 => (1e-2, 1e-2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{shape, DType};

    #[test]
    fn test_map_tensors_requires_one_shape() -> anyhow::Result<()> {
        let desc = TensorDescriptor::buffer(DType::F16);
        let mut rng = test_rng();
        let a = rand_tensor(shape![1, 2, 2, 3], desc, -1., 1., &mut rng)?;
        let b = rand_tensor(shape![1, 2, 2, 4], desc, -1., 1., &mut rng)?;
        assert!(a.data().iter().all(|v| (-1. ..=1.).contains(v)));
        assert!(map_tensors(&[&a, &b], desc, |x| x[0] + x[1]).is_err());
        assert!(map_tensors(&[], desc, |_| 0.).is_err());

        let doubled = map_tensors(&[&a], desc, |x| 2. * x[0])?;
        all_close(&doubled, &map_tensors(&[&a, &a], desc, |x| x[0] + x[1])?, 0., 0.)
    }
}
