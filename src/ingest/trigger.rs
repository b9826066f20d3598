use chrono::Utc;

use crate::config::ShardLayout;
use crate::error::RemoteError;
use crate::ingest::StepResult;
use crate::partition::Worker;
use crate::remote::{BackgroundHandle, Execution, Invocation, RemoteCommand, RemoteExecutor};

/// Start the fetch script on every worker without waiting for it.
///
/// Each worker reads its `rid.txt`, pulls the listed items from `bulk_store`
/// and writes them under the shard's `img/` directory. Workers are triggered
/// independently; a failure to start on one does not stop the others.
pub async fn trigger_downloads(
    executor: &dyn RemoteExecutor,
    workers: &[Worker],
    fetch_script: &str,
    layout: &ShardLayout,
    bulk_store: &str,
) -> Vec<StepResult<BackgroundHandle>> {
    let mut results = Vec::with_capacity(workers.len());
    for worker in workers {
        let result = trigger(executor, worker, fetch_script, layout, bulk_store).await;
        if let Err(e) = &result {
            tracing::error!(host = %worker, error = %e, "Failed to start download");
        }
        results.push(StepResult::new(worker.clone(), result));
    }
    results
}

pub async fn trigger(
    executor: &dyn RemoteExecutor,
    worker: &Worker,
    fetch_script: &str,
    layout: &ShardLayout,
    bulk_store: &str,
) -> Result<BackgroundHandle, RemoteError> {
    let command =
        RemoteCommand::fetch(fetch_script, &layout.rid_file, bulk_store, &layout.img_dir);
    let invocation = Invocation::background(worker.host(), command);

    match executor.execute(&invocation).await? {
        Execution::Detached(handle) => Ok(handle),
        // Only an executor overriding `execute` can finish a background call inline.
        Execution::Completed(output) => output.check().map(|_| BackgroundHandle {
            host: worker.host().to_string(),
            pid: None,
            started_at: Utc::now(),
        }),
    }
}
