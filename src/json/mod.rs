//! JSON helpers.

pub mod delta;

pub use delta::{ArrayOp, Delta, DeltaError, ObjectOp, apply, diff};
