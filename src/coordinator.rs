use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{FailurePolicy, IngestConfig};
use crate::error::Result;
use crate::ingest::{
    trigger_downloads, AssignmentDistributor, FleetState, JobLauncher, ProgressMonitor,
    RoundReport, ShardJob,
};
use crate::partition::record::{read_hosts, read_records, sample};
use crate::partition::{partition, Worker};
use crate::remote::RemoteExecutor;
use crate::report::{FleetReport, Step};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Every assigned worker downloaded its assignment and the shard build succeeded
    Completed,
    /// The operator interrupted the run
    Cancelled,
    /// The run stopped in `step`; no shard build was started after it
    Aborted { step: Step, reason: String },
    /// The shard build ran on the workers that finished; some workers did not
    Incomplete,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::Aborted { step, reason } => write!(f, "aborted in {}: {}", step, reason),
            RunStatus::Incomplete => write!(f, "incomplete"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub status: RunStatus,
    pub report: FleetReport,
}

impl RunSummary {
    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self.status {
            RunStatus::Completed => 0,
            RunStatus::Cancelled => 130,
            RunStatus::Aborted { .. } | RunStatus::Incomplete => 1,
        }
    }
}

/// Drives one ingestion run through its phases in order.
///
/// Everything that can be checked locally is checked before the first remote
/// command. `run` returns `Err` only for those local failures; once the fleet
/// has been touched every outcome is a [`RunSummary`].
pub struct Coordinator {
    config: IngestConfig,
    executor: Arc<dyn RemoteExecutor>,
    launcher: Arc<dyn JobLauncher>,
}

impl Coordinator {
    pub fn new(
        config: IngestConfig,
        executor: Arc<dyn RemoteExecutor>,
        launcher: Arc<dyn JobLauncher>,
    ) -> Self {
        Self {
            config,
            executor,
            launcher,
        }
    }

    pub async fn run<F>(&self, cancel: &CancellationToken, on_round: F) -> Result<RunSummary>
    where
        F: FnMut(&RoundReport),
    {
        let config = &self.config;
        config.validate()?;

        let records = read_records(&config.record_file).await?;
        let hosts = read_hosts(&config.host_file).await?;
        let sampled = sample(records, config.sample_size, config.seed);
        let plan = partition(&sampled, &hosts, config.group_size, config.replicate)?;

        let run_id = Uuid::new_v4();
        tracing::info!(
            run_id = %run_id,
            phase = %config.phase,
            records = sampled.len(),
            workers = plan.len(),
            groups = plan.groups(),
            replicate = config.replicate,
            "Partitioned records"
        );
        if !plan.unused_workers().is_empty() {
            tracing::warn!(
                unused = ?plan.unused_workers(),
                group_size = config.group_size,
                "Host list does not divide into whole groups; trailing workers left idle"
            );
        }
        if plan.dropped_records() > 0 {
            tracing::warn!(
                dropped = plan.dropped_records(),
                "Records left out by floor division"
            );
        }

        let mut report =
            FleetReport::new(run_id, config.phase, config.replicate, sampled.len(), &plan);
        if cancel.is_cancelled() {
            return Ok(finish(report, RunStatus::Cancelled));
        }

        // Distribution
        let layout = config.layout();
        let distributor = AssignmentDistributor::new(
            self.executor.as_ref(),
            layout.clone(),
            config.staging_dir.clone(),
        );
        let mut delivered: Vec<(Worker, u64)> = Vec::new();
        for step in distributor.distribute(&plan).await? {
            match step.result {
                Ok(delivery) => delivered.push((step.worker, delivery.records)),
                Err(e) => report.record_failure(&step.worker, Step::Distribution, e),
            }
        }
        if let Some(status) = self.check_failures(&report, Step::Distribution) {
            return Ok(finish(report, status));
        }
        if cancel.is_cancelled() {
            return Ok(finish(report, RunStatus::Cancelled));
        }

        // Trigger
        let mut monitor = ProgressMonitor::new(
            self.executor.as_ref(),
            layout.clone(),
            &config.fetch_script,
            config.monitor.clone(),
        );
        for (worker, expected) in &delivered {
            monitor.track(worker.clone(), *expected);
        }
        let workers: Vec<Worker> = delivered.into_iter().map(|(w, _)| w).collect();
        let triggered = trigger_downloads(
            self.executor.as_ref(),
            &workers,
            &config.fetch_script,
            &layout,
            &config.bulk_store,
        )
        .await;
        for step in triggered {
            match step.result {
                Ok(handle) => {
                    monitor.mark_downloading(&step.worker);
                    report.record_trigger(&step.worker, &handle);
                }
                Err(e) => {
                    monitor.mark_failed(&step.worker, e.to_string());
                    report.record_failure(&step.worker, Step::Trigger, e);
                }
            }
        }
        if let Some(status) = self.check_failures(&report, Step::Trigger) {
            monitor
                .broadcast_terminate("ingestion aborted after a failed trigger")
                .await;
            sync_progress(&mut report, &monitor);
            return Ok(finish(report, status));
        }

        // Monitor
        let outcome = monitor.run(cancel, on_round).await;
        sync_progress(&mut report, &monitor);
        match outcome {
            Ok(FleetState::Cancelled) => {
                tracing::warn!("Run cancelled; shard build skipped");
                return Ok(finish(report, RunStatus::Cancelled));
            }
            // `run` only returns terminal states, so this is `Done`.
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "Download aborted");
                return Ok(finish(
                    report,
                    RunStatus::Aborted {
                        step: Step::Download,
                        reason: e.to_string(),
                    },
                ));
            }
        }
        if let Some(status) = self.check_failures(&report, Step::Download) {
            return Ok(finish(report, status));
        }

        // Shard build
        let completed = report.completed_workers();
        if completed.is_empty() {
            tracing::error!("No worker finished downloading; shard build skipped");
            return Ok(finish(report, RunStatus::Incomplete));
        }
        let job = ShardJob::prepare(
            completed,
            &config.staging_dir,
            layout.shard_dir.clone(),
            config.launch.mean_file.clone(),
            config.launch.resize,
        )
        .await?;
        match self.launcher.launch(&job).await {
            Ok(code) => report.shard_build_exit = Some(code),
            Err(e) => {
                tracing::error!(error = %e, "Shard build failed");
                return Ok(finish(
                    report,
                    RunStatus::Aborted {
                        step: Step::ShardBuild,
                        reason: e.to_string(),
                    },
                ));
            }
        }

        let status = if report.failed().is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Incomplete
        };
        Ok(finish(report, status))
    }

    /// Under the abort policy any failed worker stops the run after `step`.
    fn check_failures(&self, report: &FleetReport, step: Step) -> Option<RunStatus> {
        let failed = report.failed();
        if failed.is_empty() {
            return None;
        }
        match self.config.failure_policy {
            FailurePolicy::Abort => {
                tracing::error!(step = %step, failed = failed.len(), "Aborting run");
                Some(RunStatus::Aborted {
                    step,
                    reason: format!("{} worker(s) failed", failed.len()),
                })
            }
            FailurePolicy::Continue => {
                tracing::warn!(
                    step = %step,
                    failed = failed.len(),
                    "Continuing without failed workers"
                );
                None
            }
        }
    }
}

fn sync_progress(report: &mut FleetReport, monitor: &ProgressMonitor<'_>) {
    for (worker, state, snapshot) in monitor.states() {
        report.record_progress(&worker, state, snapshot.as_ref());
    }
}

fn finish(mut report: FleetReport, status: RunStatus) -> RunSummary {
    report.finish();
    tracing::info!(run_id = %report.run_id, status = %status, "Run finished");
    RunSummary { status, report }
}
