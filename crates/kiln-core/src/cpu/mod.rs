//! Reference device and queue.
//!
//! [`CpuDevice`] "builds" a kernel by validating its body, and [`CpuQueue`]
//! runs dispatches by interpreting the body over the launch grid, exactly as
//! the rendered shader maps threads to elements. Every dispatch is recorded,
//! which makes the number of launches observable.

mod interpret;

use crate::{
    CommandQueue, ComputeDevice, DeviceLimits, Dispatch, KernelBody, KernelBuildError, KernelKey,
    KernelProgram, NativeKernel, Precision, QueueError, TensorPool,
};
use glam::UVec3;
use std::sync::Arc;

/// Kernel artifact produced by [`CpuDevice`].
#[derive(Debug, Clone)]
pub struct CpuKernel {
    pub body: KernelBody,
    pub precision: Precision,
    pub grid_tensor: String,
}

#[derive(Debug, Clone, Default)]
pub struct CpuDevice {
    limits: DeviceLimits,
}

impl CpuDevice {
    pub fn new(limits: DeviceLimits) -> Self {
        Self { limits }
    }
}

impl ComputeDevice for CpuDevice {
    fn name(&self) -> &str {
        "cpu"
    }

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn build_kernel(&self, program: &KernelProgram) -> Result<NativeKernel, KernelBuildError> {
        let source = &program.source;
        source
            .body
            .check_locals()
            .map_err(|reason| KernelBuildError::Build {
                key: program.key.clone(),
                reason,
            })?;
        Ok(Arc::new(CpuKernel {
            body: source.body.clone(),
            precision: source.precision,
            grid_tensor: source.grid_tensor.clone(),
        }))
    }
}

/// One launch seen by a [`CpuQueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub key: KernelKey,
    pub grid: UVec3,
    pub work_group: UVec3,
}

#[derive(Debug, Default)]
pub struct CpuQueue {
    limits: DeviceLimits,
    records: Vec<DispatchRecord>,
}

impl CpuQueue {
    pub fn new(limits: DeviceLimits) -> Self {
        Self {
            limits,
            records: vec![],
        }
    }

    pub fn dispatch_count(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[DispatchRecord] {
        &self.records
    }

    pub fn reset(&mut self) {
        self.records.clear();
    }
}

impl CommandQueue for CpuQueue {
    fn dispatch(
        &mut self,
        dispatch: Dispatch<'_>,
        tensors: &mut TensorPool,
    ) -> Result<(), QueueError> {
        if !self.limits.allows(dispatch.work_group) {
            return Err(QueueError::WorkGroupTooLarge {
                work_group: dispatch.work_group,
                limits: self.limits.clone(),
            });
        }
        let kernel = dispatch
            .kernel
            .native()
            .downcast_ref::<CpuKernel>()
            .ok_or_else(|| {
                QueueError::Submit(format!(
                    "kernel {} was not built for the cpu device",
                    dispatch.kernel.key()
                ))
            })?;
        interpret::run(kernel, &dispatch, tensors)?;
        self.records.push(DispatchRecord {
            key: dispatch.kernel.key().clone(),
            grid: dispatch.grid,
            work_group: dispatch.work_group,
        });
        Ok(())
    }
}
