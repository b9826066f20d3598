//! Fleet-wide outcome of a run and its console rendering.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::Phase;
use crate::ingest::{ProgressSnapshot, RoundReport, WorkerState};
use crate::partition::{PartitionPlan, Worker};
use crate::remote::BackgroundHandle;

/// Run phase in which a worker, or the run as a whole, failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Distribution,
    Trigger,
    Download,
    ShardBuild,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Distribution => write!(f, "distribution"),
            Step::Trigger => write!(f, "trigger"),
            Step::Download => write!(f, "download"),
            Step::ShardBuild => write!(f, "shard build"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub worker: Worker,
    pub group: usize,
    /// Records in the worker's assignment
    pub assigned: usize,
    pub state: WorkerState,
    pub fetched: Option<u64>,
    pub percentage: Option<f64>,
    /// Local pid of the background download transport
    pub download_pid: Option<u32>,
    pub failed_step: Option<Step>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phase: Phase,
    pub group_size: usize,
    pub replicate: bool,
    pub records_sampled: usize,
    /// Records lost to floor division in the partitioner
    pub records_dropped: usize,
    /// Host-list tail that does not fill a whole group
    pub unused_workers: Vec<Worker>,
    pub workers: Vec<WorkerReport>,
    pub shard_build_exit: Option<i32>,
}

impl FleetReport {
    pub fn new(
        run_id: Uuid,
        phase: Phase,
        replicate: bool,
        records_sampled: usize,
        plan: &PartitionPlan,
    ) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            phase,
            group_size: plan.group_size(),
            replicate,
            records_sampled,
            records_dropped: plan.dropped_records(),
            unused_workers: plan.unused_workers().to_vec(),
            workers: plan
                .assignments()
                .iter()
                .map(|a| WorkerReport {
                    worker: a.worker.clone(),
                    group: a.group,
                    assigned: a.records.len(),
                    state: WorkerState::Pending,
                    fetched: None,
                    percentage: None,
                    download_pid: None,
                    failed_step: None,
                })
                .collect(),
            shard_build_exit: None,
        }
    }

    fn entry_mut(&mut self, worker: &Worker) -> Option<&mut WorkerReport> {
        self.workers.iter_mut().find(|w| &w.worker == worker)
    }

    pub fn get(&self, worker: &Worker) -> Option<&WorkerReport> {
        self.workers.iter().find(|w| &w.worker == worker)
    }

    /// Mark `worker` failed in `step`. The first failure is the one kept.
    pub fn record_failure(&mut self, worker: &Worker, step: Step, error: impl ToString) {
        if let Some(entry) = self.entry_mut(worker) {
            if entry.failed_step.is_none() {
                entry.failed_step = Some(step);
                entry.state = WorkerState::Failed(error.to_string());
            }
        }
    }

    pub fn record_trigger(&mut self, worker: &Worker, handle: &BackgroundHandle) {
        if let Some(entry) = self.entry_mut(worker) {
            entry.download_pid = handle.pid;
            entry.state = WorkerState::Downloading;
        }
    }

    /// Copy the monitor's final view of `worker` into the report.
    pub fn record_progress(
        &mut self,
        worker: &Worker,
        state: WorkerState,
        snapshot: Option<&ProgressSnapshot>,
    ) {
        let Some(entry) = self.entry_mut(worker) else {
            return;
        };
        if let Some(snapshot) = snapshot {
            entry.fetched = Some(snapshot.fetched);
            entry.percentage = Some(snapshot.percentage);
        }
        if entry.failed_step.is_some() {
            return;
        }
        if let WorkerState::Failed(reason) = &state {
            entry.failed_step = Some(Step::Download);
            entry.state = WorkerState::Failed(reason.clone());
        } else {
            entry.state = state;
        }
    }

    pub fn failed(&self) -> Vec<&WorkerReport> {
        self.workers
            .iter()
            .filter(|w| matches!(w.state, WorkerState::Failed(_)))
            .collect()
    }

    pub fn completed_workers(&self) -> Vec<Worker> {
        self.workers
            .iter()
            .filter(|w| w.state == WorkerState::Complete)
            .map(|w| w.worker.clone())
            .collect()
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Run {} ({} phase)", self.run_id, self.phase);
        let _ = writeln!(out, "{}", "=".repeat(78));
        let _ = writeln!(
            out,
            "Group size: {}  Replicate: {}  Records: {} sampled, {} dropped",
            self.group_size, self.replicate, self.records_sampled, self.records_dropped
        );
        if !self.unused_workers.is_empty() {
            let unused: Vec<&str> = self.unused_workers.iter().map(|w| w.host()).collect();
            let _ = writeln!(out, "Unused workers: {}", unused.join(", "));
        }
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:<24} {:<6} {:<9} {:<9} {:<9} STATE",
            "WORKER", "GROUP", "ASSIGNED", "FETCHED", "PERCENT"
        );
        let _ = writeln!(out, "{}", "-".repeat(78));
        for w in &self.workers {
            let fetched = w.fetched.map_or("-".to_string(), |f| f.to_string());
            let percent = w.percentage.map_or("-".to_string(), |p| format!("{:.3}%", p));
            let state = match (&w.state, w.failed_step) {
                (WorkerState::Failed(reason), Some(step)) => {
                    format!("failed in {}: {}", step, reason)
                }
                (state, _) => state.to_string(),
            };
            let _ = writeln!(
                out,
                "{:<24} {:<6} {:<9} {:<9} {:<9} {}",
                w.worker.host(),
                w.group,
                w.assigned,
                fetched,
                percent,
                state
            );
        }
        if let Some(code) = self.shard_build_exit {
            let _ = writeln!(out);
            let _ = writeln!(out, "Shard build exit status: {}", code);
        }
        out
    }
}

/// Per-round progress lines, one per polled worker.
pub fn render_round(report: &RoundReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "****************** round {} at {} ******************",
        report.round,
        report.at.format("%c")
    );
    for s in &report.snapshots {
        let _ = writeln!(
            out,
            "{}---downloaded {:>5}, total {:>5}, percentage {:.3}%{}",
            s.worker,
            s.fetched,
            s.total,
            s.percentage,
            if s.alive { "" } else { " (finished)" }
        );
    }
    for (worker, error) in &report.errors {
        let _ = writeln!(out, "{}---query failed: {}", worker, error);
    }
    let _ = writeln!(out, "{} worker(s) still downloading", report.alive);
    out
}
