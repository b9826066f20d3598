//! The ingestion phases, in run order.
//!
//! 1. [`distributor`] stages each assignment locally and installs it as a
//!    read-only `rid.txt` in the worker's shard directory
//! 2. [`trigger`] starts the fetch script on every worker in the background
//! 3. [`monitor`] polls fetched/total counts and liveness until the fleet is
//!    done or the operator cancels
//! 4. [`launcher`] runs the collective shard build across the finished workers
//!
//! Per-worker remote failures never abort a phase on their own; each phase
//! hands back one [`StepResult`] per worker and the caller applies the
//! failure policy.

pub mod distributor;
pub mod launcher;
pub mod monitor;
pub mod trigger;

pub use distributor::{AssignmentDistributor, Delivery};
pub use launcher::{JobLauncher, MpiLauncher, ShardJob};
pub use monitor::{FleetState, ProgressMonitor, ProgressSnapshot, RoundReport, WorkerState};
pub use trigger::trigger_downloads;

use crate::error::RemoteError;
use crate::partition::Worker;

/// Outcome of one phase on one worker.
#[derive(Debug, Clone)]
pub struct StepResult<T> {
    pub worker: Worker,
    pub result: Result<T, RemoteError>,
}

impl<T> StepResult<T> {
    pub fn new(worker: Worker, result: Result<T, RemoteError>) -> Self {
        Self { worker, result }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}
