//! # kiln
//!
//! Kernel code generation and elementwise fusion for GPU tensor operations.
//!
//! An [`Operation`] owns a generated kernel body, a named [`Arguments`] set and,
//! once compiled, a [`CompiledKernel`] handle obtained from a [`ProgramCache`].
//! Cheap elementwise operations ([`ElementwiseOperation`]) can be dispatched on
//! their own, or linked into a host operation so that a single dispatch
//! computes the whole chain.
//!
//! ```text
//! OperationDef ─► GpuOperation ─► add_operation(elementwise...) ─► compile ─► tune ─► add_to_queue
//! ```

mod arguments;
pub mod cpu;
mod definition;
mod dtype;
mod elementwise;
mod enforcer;
pub mod gpu;
mod kernel;
mod op;
pub mod ops;
mod shape;
mod storage;
mod tensor;
pub mod test_utils;

pub use arguments::*;
pub use definition::*;
pub use dtype::*;
pub use elementwise::*;
pub use enforcer::*;
pub use gpu::*;
pub use kernel::*;
pub use op::*;
pub use shape::*;
pub use storage::*;
pub use tensor::*;

#[doc(hidden)]
pub use smallvec;

/// Small inline vector used for tensor lists, shapes and argument tables.
pub type RVec<T> = smallvec::SmallVec<[T; 4]>;

#[macro_export]
macro_rules! rvec {
    ($($x:tt)*) => {
        $crate::smallvec::smallvec![$($x)*]
    };
}

#[macro_export]
macro_rules! shape {
    ($($x:expr),*$(,)*) => {
        $crate::Shape::new($crate::rvec![$($x),*])
    };
}
