use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::Serialize;

use crate::error::ConfigError;

/// Dataset phase; also the name of the shard subfolder on every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Train,
    Validation,
    Test,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Validation => "validation",
            Phase::Test => "test",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when some workers fail during distribution or download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the run as soon as a phase reports a failed worker.
    #[default]
    Abort,
    /// Carry on with the workers that succeeded and report the rest at the end.
    Continue,
}

/// How remote commands reach the workers.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Program used for remote commands
    pub ssh_program: String,
    /// Program used to copy files to workers
    pub scp_program: String,
    /// Passed to the transport as `ConnectTimeout`
    pub connect_timeout_secs: u64,
    /// Upper bound for a single synchronous remote command
    pub command_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
            connect_timeout_secs: 10,
            command_timeout: Duration::from_secs(60),
        }
    }
}

/// Polling behavior of the progress monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sleep between two poll rounds
    pub poll_interval: Duration,
    /// Consecutive failed polls after which a worker is given up on
    pub max_poll_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            max_poll_failures: 3,
        }
    }
}

/// Launch settings for the collective shard build.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Cluster launcher, invoked as `<launcher> -np N -hostfile FILE ...`
    pub launcher: String,
    /// Shard builder executable, looked up in the working directory
    pub loader: PathBuf,
    /// Normalization mean artifact passed as `--mean`
    pub mean_file: PathBuf,
    /// Resize dimension passed as both `--width` and `--height`
    pub resize: u32,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            launcher: "mpirun".to_string(),
            loader: PathBuf::from("loader"),
            mean_file: PathBuf::from("examples/imagenet12/imagenet_mean.binaryproto"),
            resize: 256,
        }
    }
}

/// Complete configuration of one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Number of records sampled from the record list
    pub sample_size: usize,
    /// Workers per group
    pub group_size: usize,
    /// Replicate the group slice on every group member
    pub replicate: bool,
    pub phase: Phase,
    /// Candidate record list, may hold more than `sample_size` lines
    pub record_file: PathBuf,
    /// One worker host per line
    pub host_file: PathBuf,
    /// Absolute shard root, identical on every worker
    pub local_root: PathBuf,
    /// Bulk-store directory the fetch script reads from
    pub bulk_store: String,
    /// Fetch script path on the workers
    pub fetch_script: String,
    /// Seed for the record shuffle; random when unset
    pub seed: Option<u64>,
    /// Local directory for staged assignment files and the launch host file
    pub staging_dir: PathBuf,
    pub failure_policy: FailurePolicy,
    pub transport: TransportConfig,
    pub monitor: MonitorConfig,
    pub launch: LaunchConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sample_size: 1000,
            group_size: 1,
            replicate: true,
            phase: Phase::Validation,
            record_file: PathBuf::from("examples/imagenet12/validation_label.txt"),
            host_file: PathBuf::from("examples/imagenet12/hostfile"),
            local_root: PathBuf::from("/data1/lapis/"),
            bulk_store: "imagenet12/validation".to_string(),
            fetch_script: "download.sh".to_string(),
            seed: None,
            staging_dir: std::env::temp_dir()
                .join(format!("fleet-ingest-{}", uuid::Uuid::new_v4())),
            failure_policy: FailurePolicy::default(),
            transport: TransportConfig::default(),
            monitor: MonitorConfig::default(),
            launch: LaunchConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Check everything that can be checked before touching the fleet.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.local_root.is_absolute() {
            return Err(ConfigError::RelativeLocalRoot(self.local_root.clone()));
        }
        if self.group_size == 0 {
            return Err(ConfigError::ZeroGroupSize);
        }
        if self.launch.resize == 0 {
            return Err(ConfigError::Invalid {
                field: "resize",
                reason: "must be positive".to_string(),
            });
        }
        if self.fetch_script.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "fetch_script",
                reason: "must not be empty".to_string(),
            });
        }
        if !self.launch.loader.is_file() {
            return Err(ConfigError::LoaderNotFound(self.launch.loader.clone()));
        }
        Ok(())
    }

    /// `<local>/<phase>` on every worker.
    pub fn shard_dir(&self) -> PathBuf {
        self.local_root.join(self.phase.as_str())
    }

    /// Remote layout derived from the shard directory.
    pub fn layout(&self) -> ShardLayout {
        ShardLayout::new(&self.shard_dir())
    }
}

/// Per-worker remote paths, rendered once as strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
    pub shard_dir: String,
    pub rid_file: String,
    pub img_dir: String,
}

impl ShardLayout {
    pub fn new(shard_dir: &Path) -> Self {
        Self {
            shard_dir: shard_dir.to_string_lossy().into_owned(),
            rid_file: shard_dir.join("rid.txt").to_string_lossy().into_owned(),
            img_dir: shard_dir.join("img").to_string_lossy().into_owned(),
        }
    }
}
