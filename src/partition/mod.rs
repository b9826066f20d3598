//! Record and host list handling plus the group partitioner.
//!
//! - [`record`]: the `Record` / `Worker` types, list parsing and sampling
//! - [`partitioner`]: the pure mapping from records and workers to
//!   per-worker assignments

pub mod partitioner;
pub mod record;

pub use partitioner::{partition, Assignment, PartitionPlan};
pub use record::{Record, Worker};
