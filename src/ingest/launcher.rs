use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::LaunchConfig;
use crate::error::{IngestError, Result};
use crate::partition::Worker;

/// One collective shard build across a set of workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardJob {
    pub hosts: Vec<Worker>,
    /// Host file handed to the cluster launcher, one host per line
    pub host_file: PathBuf,
    pub shard_dir: String,
    pub mean_file: PathBuf,
    pub resize: u32,
}

impl ShardJob {
    /// Write the host file for `hosts` into `staging_dir` and describe the job.
    pub async fn prepare(
        hosts: Vec<Worker>,
        staging_dir: &Path,
        shard_dir: String,
        mean_file: PathBuf,
        resize: u32,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(staging_dir).await?;
        let host_file = staging_dir.join("hostfile");

        let mut content = String::new();
        for host in &hosts {
            content.push_str(host.host());
            content.push('\n');
        }
        tokio::fs::write(&host_file, content).await?;

        Ok(Self {
            hosts,
            host_file,
            shard_dir,
            mean_file,
            resize,
        })
    }
}

/// Starts the shard build and waits for the whole job to finish.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    /// Returns the job's exit code; any failure fails the run.
    async fn launch(&self, job: &ShardJob) -> Result<i32>;
}

/// Launches the loader through an MPI-style launcher:
/// `mpirun -np N -hostfile FILE ./loader --dir=.. --mean=.. --width=S --height=S`.
#[derive(Debug, Clone)]
pub struct MpiLauncher {
    launcher: String,
    loader: PathBuf,
}

impl MpiLauncher {
    pub fn new(config: &LaunchConfig) -> Self {
        Self {
            launcher: config.launcher.clone(),
            loader: config.loader.clone(),
        }
    }

    /// Arguments passed to the launcher for `job`.
    pub fn args(&self, job: &ShardJob) -> Vec<String> {
        // Relative loaders are resolved against the working directory on each host.
        let loader = if self.loader.is_absolute() {
            self.loader.clone()
        } else {
            Path::new(".").join(&self.loader)
        };

        vec![
            "-np".to_string(),
            job.hosts.len().to_string(),
            "-hostfile".to_string(),
            job.host_file.to_string_lossy().into_owned(),
            loader.to_string_lossy().into_owned(),
            format!("--dir={}", job.shard_dir),
            format!("--mean={}", job.mean_file.to_string_lossy()),
            format!("--width={}", job.resize),
            format!("--height={}", job.resize),
        ]
    }
}

#[async_trait]
impl JobLauncher for MpiLauncher {
    async fn launch(&self, job: &ShardJob) -> Result<i32> {
        let args = self.args(job);
        tracing::info!(
            launcher = %self.launcher,
            workers = job.hosts.len(),
            args = ?args,
            "Launching shard build"
        );

        let status = Command::new(&self.launcher)
            .args(&args)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                IngestError::Launch(format!("failed to start {}: {}", self.launcher, e))
            })?;

        match status.code() {
            Some(0) => {
                tracing::info!("Shard build finished");
                Ok(0)
            }
            Some(code) => Err(IngestError::Launch(format!("exited with status {}", code))),
            None => Err(IngestError::Launch("terminated by signal".to_string())),
        }
    }
}
