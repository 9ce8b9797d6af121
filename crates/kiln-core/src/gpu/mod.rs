mod device;
pub mod fusion;
mod program_cache;
mod queue;
pub mod tuning;
pub mod wgsl;

pub use device::*;
pub use fusion::{link_postfix, merge_operations, MergedCode};
pub use program_cache::*;
pub use queue::*;
pub use tuning::{CostModelPicker, TuningParameters, TuningType, WorkGroupPicker};
