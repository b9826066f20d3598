use std::path::{Path, PathBuf};

use futures::future::join_all;

use crate::config::ShardLayout;
use crate::error::{RemoteError, Result};
use crate::ingest::StepResult;
use crate::partition::{Assignment, PartitionPlan, Record};
use crate::remote::{RemoteCommand, RemoteExecutor};

/// An assignment file installed on a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Lines written to the worker's `rid.txt`
    pub records: u64,
    /// Local staging copy
    pub staged: PathBuf,
}

/// Writes each worker's record list to a staging file and installs it as the
/// worker's read-only assignment file.
pub struct AssignmentDistributor<'a> {
    executor: &'a dyn RemoteExecutor,
    layout: ShardLayout,
    staging_dir: PathBuf,
}

impl<'a> AssignmentDistributor<'a> {
    pub fn new(
        executor: &'a dyn RemoteExecutor,
        layout: ShardLayout,
        staging_dir: PathBuf,
    ) -> Self {
        Self {
            executor,
            layout,
            staging_dir,
        }
    }

    /// Deliver every assignment of `plan`.
    ///
    /// Local staging failures are fatal and returned as `Err`. Remote failures
    /// are reported per worker in host-list order.
    pub async fn distribute(&self, plan: &PartitionPlan) -> Result<Vec<StepResult<Delivery>>> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        let mut staged = Vec::with_capacity(plan.len());
        for (index, assignment) in plan.assignments().iter().enumerate() {
            let path = self.staging_dir.join(staging_name(index, assignment));
            write_assignment(&path, &assignment.records).await?;
            staged.push((assignment, path));
        }

        let deliveries = staged.into_iter().map(|(assignment, path)| async move {
            let result = self.deliver(assignment, &path).await.map(|_| Delivery {
                records: assignment.records.len() as u64,
                staged: path,
            });
            match &result {
                Ok(_) => tracing::info!(
                    host = %assignment.worker,
                    records = assignment.records.len(),
                    rid_file = %self.layout.rid_file,
                    "Assignment installed"
                ),
                Err(e) => tracing::error!(
                    host = %assignment.worker,
                    error = %e,
                    "Assignment delivery failed"
                ),
            }
            StepResult::new(assignment.worker.clone(), result)
        });

        Ok(join_all(deliveries).await)
    }

    async fn deliver(
        &self,
        assignment: &Assignment,
        staged: &Path,
    ) -> std::result::Result<(), RemoteError> {
        let host = assignment.worker.host();
        let layout = &self.layout;

        // Items left from an earlier run would count as fetched.
        self.executor
            .run(host, &RemoteCommand::remove_dir_all(&layout.img_dir))
            .await?
            .check()?;
        self.executor
            .run(host, &RemoteCommand::mkdir_p(&layout.shard_dir).arg(&layout.img_dir))
            .await?
            .check()?;
        // A previous run leaves rid.txt read-only.
        self.executor
            .run(host, &RemoteCommand::remove_file(&layout.rid_file))
            .await?
            .check()?;
        self.executor.copy_to(host, staged, &layout.rid_file).await?;
        self.executor
            .run(host, &RemoteCommand::make_read_only(&layout.rid_file))
            .await?
            .check()?;
        Ok(())
    }
}

/// One record per line, newline terminated, so the remote `wc -l` equals the
/// record count.
pub async fn write_assignment(path: &Path, records: &[Record]) -> std::io::Result<()> {
    let len = records.iter().map(|r| r.as_str().len() + 1).sum();
    let mut content = String::with_capacity(len);
    for record in records {
        content.push_str(record.as_str());
        content.push('\n');
    }
    tokio::fs::write(path, content).await
}

fn staging_name(index: usize, assignment: &Assignment) -> String {
    let host: String = assignment
        .worker
        .host()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{index:04}-{host}.rid.txt")
}
