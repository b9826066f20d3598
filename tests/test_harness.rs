//! Test harness for ingestion runs without a real fleet.
//!
//! [`MockExecutor`] answers remote commands from a per-host script and records
//! every call; [`MockLauncher`] stands in for the cluster launcher.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use fleet_ingest::config::{IngestConfig, LaunchConfig, MonitorConfig, Phase};
use fleet_ingest::error::{IngestError, RemoteError};
use fleet_ingest::ingest::{JobLauncher, ShardJob};
use fleet_ingest::partition::Worker;
use fleet_ingest::remote::{BackgroundHandle, RemoteCommand, RemoteExecutor, RemoteOutput};

/// How one host behaves.
#[derive(Debug, Clone, Default)]
pub struct HostScript {
    /// Every command fails as if the host were down
    pub unreachable: bool,
    /// `copy_to` fails with a permission error
    pub deny_copy: bool,
    /// Background starts of the fetch script fail
    pub fail_fetch: bool,
    /// `(fetched, alive)` per poll round; the last entry repeats. Empty means
    /// `img/` is read as it is: each fetch start adds the delivered records to
    /// it and the fetch is finished on the first poll.
    pub progress: Vec<(u64, bool)>,
    /// Reported `wc -l` count instead of the delivered line count
    pub total_override: Option<u64>,
    /// `ls` failures before it starts answering
    pub failing_polls: u32,
    /// How the background fetch exits after it was started
    pub background_exit: Option<RemoteError>,
}

impl HostScript {
    pub fn progress(rounds: &[(u64, bool)]) -> Self {
        Self {
            progress: rounds.to_vec(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Run,
    Spawn,
    Copy,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub host: String,
    pub kind: CallKind,
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Default)]
struct HostState {
    script: HostScript,
    delivered: Option<String>,
    round: usize,
    current: (u64, bool),
    polls_failed: u32,
    /// Entries in the worker's `img/`
    img_files: u64,
    exited: Option<RemoteError>,
}

#[derive(Debug, Default)]
pub struct MockExecutor {
    hosts: Mutex<HashMap<String, HostState>>,
    calls: Mutex<Vec<Call>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, host: &str, script: HostScript) -> Self {
        self.hosts.lock().unwrap().insert(
            host.to_string(),
            HostState {
                script,
                ..HostState::default()
            },
        );
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Hosts that received `program`, in call order.
    pub fn hosts_called(&self, program: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .map(|c| c.host)
            .collect()
    }

    pub fn calls_for(&self, host: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.host == host).collect()
    }

    /// Assignment file content copied to `host`.
    pub fn delivered(&self, host: &str) -> Option<String> {
        self.hosts
            .lock()
            .unwrap()
            .get(host)
            .and_then(|h| h.delivered.clone())
    }

    fn record(&self, host: &str, kind: CallKind, program: &str, args: &[String]) {
        self.calls.lock().unwrap().push(Call {
            host: host.to_string(),
            kind,
            program: program.to_string(),
            args: args.to_vec(),
        });
    }

    fn respond(&self, host: &str, command: &RemoteCommand) -> Result<RemoteOutput, RemoteError> {
        let mut hosts = self.hosts.lock().unwrap();
        let state = hosts.entry(host.to_string()).or_default();
        if state.script.unreachable {
            return Err(unreachable(host));
        }

        let delivered_lines = state
            .delivered
            .as_ref()
            .map_or(0, |d| d.lines().count() as u64);
        let (code, stdout) = match command.program() {
            "ls" => {
                if state.polls_failed < state.script.failing_polls {
                    state.polls_failed += 1;
                    return Err(RemoteError::Timeout {
                        host: host.to_string(),
                        secs: 60,
                    });
                }
                state.current = if state.script.progress.is_empty() {
                    (state.img_files, false)
                } else {
                    let idx = state.round.min(state.script.progress.len() - 1);
                    state.script.progress[idx]
                };
                state.round += 1;
                let listing: String = (0..state.current.0)
                    .map(|i| format!("{i}.jpg\n"))
                    .collect();
                (0, listing)
            }
            "wc" => {
                let total = state.script.total_override.unwrap_or(delivered_lines);
                let path = command.args().last().cloned().unwrap_or_default();
                (0, format!("{total} {path}\n"))
            }
            "pgrep" => (if state.current.1 { 0 } else { 1 }, String::new()),
            "rm" if command.args().first().is_some_and(|a| a == "-rf") => {
                if command.args().iter().any(|a| a.ends_with("/img")) {
                    state.img_files = 0;
                }
                (0, String::new())
            }
            _ => (0, String::new()),
        };

        Ok(RemoteOutput {
            host: host.to_string(),
            code: Some(code),
            stdout,
            stderr: String::new(),
        })
    }
}

fn unreachable(host: &str) -> RemoteError {
    RemoteError::Unreachable {
        host: host.to_string(),
        reason: "ssh: connect to host: No route to host".to_string(),
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn run(&self, host: &str, command: &RemoteCommand) -> Result<RemoteOutput, RemoteError> {
        self.record(host, CallKind::Run, command.program(), command.args());
        self.respond(host, command)
    }

    async fn spawn(
        &self,
        host: &str,
        command: &RemoteCommand,
    ) -> Result<BackgroundHandle, RemoteError> {
        self.record(host, CallKind::Spawn, command.program(), command.args());
        let mut hosts = self.hosts.lock().unwrap();
        let state = hosts.entry(host.to_string()).or_default();
        if state.script.unreachable {
            return Err(unreachable(host));
        }
        state.exited = None;
        if command.program() != "pkill" {
            if state.script.fail_fetch {
                return Err(RemoteError::CommandFailed {
                    host: host.to_string(),
                    code: Some(127),
                    stderr: "download.sh: not found".to_string(),
                });
            }
            match &state.script.background_exit {
                Some(error) => state.exited = Some(error.clone()),
                None => {
                    state.img_files += state
                        .delivered
                        .as_ref()
                        .map_or(0, |d| d.lines().count() as u64);
                }
            }
        }
        Ok(BackgroundHandle {
            host: host.to_string(),
            pid: Some(4242),
            started_at: Utc::now(),
        })
    }

    fn background_failure(&self, host: &str) -> Option<RemoteError> {
        self.hosts
            .lock()
            .unwrap()
            .get(host)
            .and_then(|h| h.exited.clone())
    }

    async fn copy_to(
        &self,
        host: &str,
        local: &Path,
        remote_path: &str,
    ) -> Result<(), RemoteError> {
        self.record(
            host,
            CallKind::Copy,
            "scp",
            &[local.display().to_string(), remote_path.to_string()],
        );
        let content = std::fs::read_to_string(local).unwrap();
        let mut hosts = self.hosts.lock().unwrap();
        let state = hosts.entry(host.to_string()).or_default();
        if state.script.unreachable {
            return Err(unreachable(host));
        }
        if state.script.deny_copy {
            return Err(RemoteError::PermissionDenied {
                host: host.to_string(),
                reason: format!("scp: {remote_path}: Permission denied"),
            });
        }
        state.delivered = Some(content);
        Ok(())
    }
}

/// Counts launches and remembers the last job.
#[derive(Debug, Default)]
pub struct MockLauncher {
    launches: AtomicUsize,
    last: Mutex<Option<ShardJob>>,
    fail: bool,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn last_job(&self) -> Option<ShardJob> {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobLauncher for MockLauncher {
    async fn launch(&self, job: &ShardJob) -> fleet_ingest::error::Result<i32> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(job.clone());
        if self.fail {
            return Err(IngestError::Launch("exited with status 1".to_string()));
        }
        Ok(0)
    }
}

pub fn workers(hosts: &[&str]) -> Vec<Worker> {
    hosts.iter().map(|h| Worker::new(*h)).collect()
}

/// Monitor settings that poll without waiting.
pub fn fast_monitor() -> MonitorConfig {
    MonitorConfig {
        poll_interval: Duration::from_millis(1),
        max_poll_failures: 3,
    }
}

/// Input files and a loader inside a scratch directory.
pub struct Fixture {
    pub dir: TempDir,
    pub config: IngestConfig,
}

impl Fixture {
    pub fn new(records: usize, hosts: &[&str], group_size: usize, replicate: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let record_file = dir.path().join("records.txt");
        let host_file = dir.path().join("hosts.txt");
        let loader = dir.path().join("loader");

        let lines: String = (0..records)
            .map(|i| format!("img{i:05}.jpg {}\n", i % 10))
            .collect();
        std::fs::write(&record_file, lines).unwrap();
        std::fs::write(&host_file, hosts.join("\n") + "\n").unwrap();
        std::fs::write(&loader, "#!/bin/sh\n").unwrap();

        let config = IngestConfig {
            sample_size: records,
            group_size,
            replicate,
            phase: Phase::Train,
            record_file,
            host_file,
            local_root: PathBuf::from("/data/lapis"),
            bulk_store: "imagenet12/train".to_string(),
            fetch_script: "/opt/ingest/download.sh".to_string(),
            seed: Some(7),
            staging_dir: dir.path().join("staging"),
            monitor: fast_monitor(),
            launch: LaunchConfig {
                loader,
                ..LaunchConfig::default()
            },
            ..IngestConfig::default()
        };

        Self { dir, config }
    }
}
