use crate::{ArgumentError, BoundArguments, CompiledKernel, DeviceLimits, TensorError, TensorPool};
use glam::UVec3;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Bind(#[from] ArgumentError),
    #[error("Work-group {work_group} exceeds device limits {limits:?}")]
    WorkGroupTooLarge {
        work_group: UVec3,
        limits: DeviceLimits,
    },
    #[error("Failed to submit kernel: {0}")]
    Submit(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// A single kernel launch.
#[derive(Debug)]
pub struct Dispatch<'a> {
    pub kernel: &'a CompiledKernel,
    pub args: &'a BoundArguments,
    /// Total threads per dimension. Queues round up to whole work-groups.
    pub grid: UVec3,
    pub work_group: UVec3,
}

impl Dispatch<'_> {
    /// Number of work-groups launched per dimension.
    pub fn work_group_count(&self) -> UVec3 {
        let wg = self.work_group.max(UVec3::ONE);
        (self.grid + wg - UVec3::ONE) / wg
    }
}

/// The command queue collaborator.
pub trait CommandQueue {
    fn dispatch(&mut self, dispatch: Dispatch<'_>, tensors: &mut TensorPool)
        -> Result<(), QueueError>;
}
