use crate::{CompilerOption, KernelKey, KernelSource, RVec};
use glam::UVec3;
use std::any::Any;
use std::sync::Arc;

/// Work-group limits of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum number of invocations in one work-group.
    pub max_invocations: u32,
    /// Maximum extent of a work-group along each dimension.
    pub max_work_group_size: UVec3,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_invocations: 256,
            max_work_group_size: UVec3::new(256, 256, 64),
        }
    }
}

impl DeviceLimits {
    pub fn new(max_invocations: u32, max_work_group_size: UVec3) -> Self {
        Self {
            max_invocations,
            max_work_group_size,
        }
    }

    pub fn allows(&self, work_group: UVec3) -> bool {
        work_group.x >= 1
            && work_group.y >= 1
            && work_group.z >= 1
            && work_group.cmple(self.max_work_group_size).all()
            && volume(work_group) <= self.max_invocations as u64
    }

    /// Shrinks `work_group` until it fits, halving the largest dimension first.
    pub fn clamp(&self, work_group: UVec3) -> UVec3 {
        let mut wg = work_group
            .max(UVec3::ONE)
            .min(self.max_work_group_size.max(UVec3::ONE));
        while volume(wg) > self.max_invocations.max(1) as u64 {
            if wg.x >= wg.y && wg.x >= wg.z {
                wg.x = (wg.x / 2).max(1);
            } else if wg.y >= wg.z {
                wg.y = (wg.y / 2).max(1);
            } else {
                wg.z = (wg.z / 2).max(1);
            }
        }
        wg
    }
}

#[inline]
pub(crate) fn volume(v: UVec3) -> u64 {
    v.x as u64 * v.y as u64 * v.z as u64
}

#[derive(Debug, thiserror::Error)]
pub enum KernelBuildError {
    #[error("Failed to build kernel `{key}`: {reason}")]
    Build { key: KernelKey, reason: String },
}

/// Device-specific artifact produced by [`ComputeDevice::build_kernel`].
pub type NativeKernel = Arc<dyn Any + Send + Sync>;

/// Everything a device needs to build a kernel.
#[derive(Debug)]
pub struct KernelProgram {
    pub key: KernelKey,
    pub source: KernelSource,
    pub options: RVec<CompilerOption>,
}

/// The compute device collaborator: reports its limits and turns programs
/// into kernels.
pub trait ComputeDevice: Send + Sync {
    fn name(&self) -> &str;

    fn limits(&self) -> &DeviceLimits;

    fn build_kernel(&self, program: &KernelProgram) -> Result<NativeKernel, KernelBuildError>;
}

/// Handle to a built kernel. Cloning is cheap; clones share the build.
#[derive(Debug, Clone)]
pub struct CompiledKernel {
    program: Arc<KernelProgram>,
    native: NativeKernel,
}

impl CompiledKernel {
    pub(crate) fn new(program: Arc<KernelProgram>, native: NativeKernel) -> Self {
        Self { program, native }
    }

    pub fn key(&self) -> &KernelKey {
        &self.program.key
    }

    pub fn program(&self) -> &KernelProgram {
        &self.program
    }

    pub fn native(&self) -> &NativeKernel {
        &self.native
    }

    /// Whether both handles share one build.
    pub fn same_build(&self, other: &CompiledKernel) -> bool {
        Arc::ptr_eq(&self.program, &other.program)
    }
}
