//! Compute DAG and loop-schedule state for the loft auto-scheduler.
//!
//! This crate holds the data model the search policy operates on:
//!
//! - [`dag`] - the compute DAG, its static access analysis and bound inference
//! - [`state`] - the immutable schedule snapshot and the schedule primitives
//! - [`step`] - the replayable transform-step history
//! - [`attach`] - the bidirectional stage/iterator attachment index

pub mod attach;
pub mod dag;
pub mod error;
pub mod state;
pub mod step;

#[cfg(test)]
mod test;

pub use attach::{AttachMap, IterKey};
pub use dag::{Axis, ComputeDag, DagBuilder, HardwareParams, OpAttrs, OpId, OpInfo, OpKind};
pub use error::{Error, Result};
pub use state::{ComputeAtKind, Iter, IterAnnotation, IterKind, Stage, State, extract_original_iterators};
pub use step::{TransformStep, print_steps_as_python};
