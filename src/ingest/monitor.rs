use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{MonitorConfig, ShardLayout};
use crate::error::{DataError, IngestError, RemoteError, Result};
use crate::partition::Worker;
use crate::remote::command::classify_failure;
use crate::remote::{process_pattern, Invocation, RemoteCommand, RemoteExecutor};

/// Where a worker stands in the download phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum WorkerState {
    /// Assignment installed, fetch script not confirmed running yet
    Pending,
    Downloading,
    Complete,
    Failed(String),
}

impl WorkerState {
    /// Still counted in the alive set.
    pub fn is_active(&self) -> bool {
        matches!(self, WorkerState::Pending | WorkerState::Downloading)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Pending => write!(f, "pending"),
            WorkerState::Downloading => write!(f, "downloading"),
            WorkerState::Complete => write!(f, "complete"),
            WorkerState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Fleet-level monitor state. `Done` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FleetState {
    Polling,
    Done,
    Cancelled,
}

/// One worker's counts from one poll round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub worker: Worker,
    pub fetched: u64,
    pub total: u64,
    pub alive: bool,
    pub percentage: f64,
}

/// Everything observed in one poll round.
#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub round: u64,
    pub at: DateTime<Utc>,
    pub snapshots: Vec<ProgressSnapshot>,
    /// Workers whose queries failed this round
    pub errors: Vec<(Worker, String)>,
    /// Workers still pending or downloading after the round
    pub alive: usize,
}

/// `fetched / total * 100`, clamped to `[0, 100]`. An empty assignment is
/// complete by definition.
pub fn percentage(fetched: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (fetched as f64 * 100.0 / total as f64).clamp(0.0, 100.0)
}

#[derive(Debug, Clone)]
struct Tracked {
    expected: u64,
    state: WorkerState,
    consecutive_failures: u32,
    last: Option<ProgressSnapshot>,
}

/// Polls the fleet for download progress.
///
/// Workers have no way to push status back, so every round asks each tracked
/// worker for three things: the number of entries in its `img/` directory,
/// the line count of its `rid.txt`, and whether the fetch script is still
/// running. State lives in a worker-indexed map and the fleet state is derived
/// from it after every round.
pub struct ProgressMonitor<'a> {
    executor: &'a dyn RemoteExecutor,
    layout: ShardLayout,
    pattern: String,
    config: MonitorConfig,
    order: Vec<Worker>,
    workers: HashMap<Worker, Tracked>,
    round: u64,
}

struct Reading {
    fetched: u64,
    total: u64,
    alive: bool,
}

impl<'a> ProgressMonitor<'a> {
    pub fn new(
        executor: &'a dyn RemoteExecutor,
        layout: ShardLayout,
        fetch_script: &str,
        config: MonitorConfig,
    ) -> Self {
        let pattern = process_pattern(fetch_script, &layout.rid_file);
        Self {
            executor,
            layout,
            pattern,
            config,
            order: Vec::new(),
            workers: HashMap::new(),
            round: 0,
        }
    }

    /// Start tracking `worker`, which was handed `expected` records.
    pub fn track(&mut self, worker: Worker, expected: u64) {
        if !self.workers.contains_key(&worker) {
            self.order.push(worker.clone());
        }
        self.workers.insert(
            worker,
            Tracked {
                expected,
                state: WorkerState::Pending,
                consecutive_failures: 0,
                last: None,
            },
        );
    }

    pub fn mark_downloading(&mut self, worker: &Worker) {
        if let Some(tracked) = self.workers.get_mut(worker) {
            if tracked.state.is_active() {
                tracked.state = WorkerState::Downloading;
            }
        }
    }

    pub fn mark_failed(&mut self, worker: &Worker, reason: impl Into<String>) {
        if let Some(tracked) = self.workers.get_mut(worker) {
            tracked.state = WorkerState::Failed(reason.into());
        }
    }

    pub fn state(&self, worker: &Worker) -> Option<&WorkerState> {
        self.workers.get(worker).map(|t| &t.state)
    }

    /// Latest snapshot per tracked worker, in tracking order.
    pub fn states(&self) -> Vec<(Worker, WorkerState, Option<ProgressSnapshot>)> {
        self.order
            .iter()
            .filter_map(|w| {
                self.workers
                    .get(w)
                    .map(|t| (w.clone(), t.state.clone(), t.last.clone()))
            })
            .collect()
    }

    /// Workers still pending or downloading.
    pub fn alive(&self) -> Vec<Worker> {
        self.order
            .iter()
            .filter(|w| self.workers.get(*w).is_some_and(|t| t.state.is_active()))
            .cloned()
            .collect()
    }

    pub fn fleet_state(&self) -> FleetState {
        if self.alive().is_empty() {
            FleetState::Done
        } else {
            FleetState::Polling
        }
    }

    pub fn rounds(&self) -> u64 {
        self.round
    }

    /// Poll until every worker has finished or `cancel` fires.
    ///
    /// A cancellation lets the current round finish, then sends one
    /// best-effort terminate to every worker still alive and returns
    /// [`FleetState::Cancelled`]. A data error sends the same terminate
    /// before it is returned.
    pub async fn run<F>(
        &mut self,
        cancel: &CancellationToken,
        mut on_round: F,
    ) -> Result<FleetState>
    where
        F: FnMut(&RoundReport),
    {
        loop {
            if cancel.is_cancelled() {
                self.broadcast_terminate("download cancelled by operator").await;
                return Ok(FleetState::Cancelled);
            }
            if self.fleet_state() == FleetState::Done {
                return Ok(FleetState::Done);
            }

            let report = match self.poll_round().await {
                Ok(report) => report,
                Err(e) => {
                    self.broadcast_terminate("ingestion aborted on data error").await;
                    return Err(e);
                }
            };
            on_round(&report);

            if self.fleet_state() == FleetState::Done {
                tracing::info!(rounds = self.round, "All workers finished downloading");
                return Ok(FleetState::Done);
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Query every alive worker once and fold the answers into its state.
    pub async fn poll_round(&mut self) -> Result<RoundReport> {
        self.round += 1;
        let mut errors = Vec::new();

        // A fetch whose transport already exited non-zero never started or
        // died early; there is nothing left to poll on that worker.
        for worker in self.alive() {
            if let Some(e) = self.executor.background_failure(worker.host()) {
                tracing::error!(host = %worker, error = %e, "Fetch script exited with an error");
                errors.push((worker.clone(), e.to_string()));
                self.mark_failed(&worker, e.to_string());
            }
        }

        let alive = self.alive();
        let readings = join_all(alive.iter().map(|w| self.query(w))).await;

        let mut snapshots = Vec::new();
        for (worker, reading) in alive.into_iter().zip(readings) {
            match reading {
                Ok(reading) => {
                    if let Some(tracked) = self.workers.get_mut(&worker) {
                        snapshots.push(fold_reading(&worker, tracked, reading)?);
                    }
                }
                Err(IngestError::Remote(e)) => {
                    errors.push((worker.clone(), e.to_string()));
                    self.record_failure(&worker, e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(RoundReport {
            round: self.round,
            at: Utc::now(),
            snapshots,
            errors,
            alive: self.alive().len(),
        })
    }

    /// Fire a terminate at every alive worker without waiting for it to land.
    ///
    /// Returns the workers that were signalled.
    pub async fn broadcast_terminate(&mut self, reason: &str) -> Vec<Worker> {
        let targets = self.alive();
        for worker in &targets {
            let invocation =
                Invocation::background(worker.host(), RemoteCommand::terminate(&self.pattern));
            match self.executor.execute(&invocation).await {
                Ok(_) => tracing::warn!(host = %worker, "Sent terminate to fetch script"),
                Err(e) => {
                    tracing::warn!(host = %worker, error = %e, "Could not send terminate")
                }
            }
            self.mark_failed(worker, reason);
        }
        targets
    }

    async fn query(&self, worker: &Worker) -> Result<Reading> {
        let host = worker.host();

        let listing = self
            .executor
            .run(host, &RemoteCommand::list_dir(&self.layout.img_dir))
            .await?
            .check()?;
        let fetched = listing
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count() as u64;

        let counted = self
            .executor
            .run(host, &RemoteCommand::line_count(&self.layout.rid_file))
            .await?
            .check()?;
        let total = counted
            .stdout
            .split_whitespace()
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| DataError::Unparseable {
                host: host.to_string(),
                query: "assignment line count",
                output: counted.stdout.clone(),
            })?;

        let running = self
            .executor
            .run(host, &RemoteCommand::process_running(&self.pattern))
            .await?;
        let alive = match running.code {
            Some(0) => true,
            Some(1) => false,
            code => return Err(classify_failure(host, code, &running.stderr).into()),
        };

        Ok(Reading {
            fetched,
            total,
            alive,
        })
    }

    fn record_failure(&mut self, worker: &Worker, error: RemoteError) {
        let limit = self.config.max_poll_failures.max(1);
        if let Some(tracked) = self.workers.get_mut(worker) {
            tracked.consecutive_failures += 1;
            tracing::warn!(
                host = %worker,
                error = %error,
                attempt = tracked.consecutive_failures,
                limit,
                "Progress query failed"
            );
            if tracked.consecutive_failures >= limit {
                tracked.state = WorkerState::Failed(error.to_string());
            }
        }
    }
}

/// Validate one reading against what was assigned and advance the worker's state.
fn fold_reading(
    worker: &Worker,
    tracked: &mut Tracked,
    reading: Reading,
) -> Result<ProgressSnapshot> {
    if reading.total != tracked.expected {
        return Err(DataError::TotalMismatch {
            host: worker.host().to_string(),
            expected: tracked.expected,
            actual: reading.total,
        }
        .into());
    }
    if reading.fetched > reading.total {
        return Err(DataError::FetchedExceedsTotal {
            host: worker.host().to_string(),
            fetched: reading.fetched,
            total: reading.total,
        }
        .into());
    }

    let snapshot = ProgressSnapshot {
        worker: worker.clone(),
        fetched: reading.fetched,
        total: reading.total,
        alive: reading.alive,
        percentage: percentage(reading.fetched, reading.total),
    };

    tracked.consecutive_failures = 0;
    tracked.state = if reading.alive {
        WorkerState::Downloading
    } else if reading.fetched == reading.total {
        tracing::info!(host = %worker, fetched = reading.fetched, "Download finished");
        WorkerState::Complete
    } else {
        tracing::warn!(
            host = %worker,
            fetched = reading.fetched,
            total = reading.total,
            "Fetch script exited before fetching every item"
        );
        WorkerState::Failed(format!(
            "fetch script exited with {} of {} items",
            reading.fetched, reading.total
        ))
    };
    tracked.last = Some(snapshot.clone());

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_of_empty_assignment_is_complete() {
        assert_eq!(percentage(0, 0), 100.0);
    }

    #[test]
    fn percentage_is_bounded() {
        assert_eq!(percentage(0, 10), 0.0);
        assert_eq!(percentage(5, 10), 50.0);
        assert_eq!(percentage(10, 10), 100.0);
        assert_eq!(percentage(25, 10), 100.0);
    }

    #[test]
    fn worker_state_activity() {
        assert!(WorkerState::Pending.is_active());
        assert!(WorkerState::Downloading.is_active());
        assert!(!WorkerState::Complete.is_active());
        assert!(!WorkerState::Failed("x".to_string()).is_active());
    }

    #[test]
    fn worker_state_display() {
        assert_eq!(WorkerState::Downloading.to_string(), "downloading");
        assert_eq!(
            WorkerState::Failed("unreachable".to_string()).to_string(),
            "failed: unreachable"
        );
    }
}
