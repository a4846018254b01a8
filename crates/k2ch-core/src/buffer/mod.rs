//! Row batching between decode and insert.
//!
//! The accumulator is owned by the ingestion loop and mutated only there,
//! so it carries no locks.

mod accumulator;

pub use accumulator::{BatchAccumulator, BatchState, FlushReason, PartitionRange};
