//! CPU backend implementations.
//!
//! - [`ReferenceBackend`] -- naive indexed loops, the ground truth for conformance.
//! - [`OptimizedBackend`] -- slice and iterator passes, in-place partitioning.
//! - [`ParallelBackend`] -- rayon data parallelism.

mod common;
mod optimized;
mod parallel;
mod reference;

pub use optimized::OptimizedBackend;
pub use parallel::ParallelBackend;
pub use reference::ReferenceBackend;

#[cfg(feature = "gpu")]
pub(crate) use common::{
    check_add, check_coalescence, check_first_in_pair, check_floor, check_gamma, check_multiply,
    check_ordering, check_pair_op, check_reduction, check_shuffle, fill_target, numeric, plan_pair,
    scalar_multiply, Binary, Numeric, ScalarTarget,
};
