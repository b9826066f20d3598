use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One line of the record list, e.g. `n01440764/n01440764_10026.JPEG 0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(String);

impl Record {
    pub fn new(line: impl Into<String>) -> Self {
        Self(line.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A worker host as named in the host list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Worker(String);

impl Worker {
    pub fn new(host: impl Into<String>) -> Self {
        Self(host.into())
    }

    pub fn host(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse record list content. Blank lines are not records.
pub fn parse_records(content: &str) -> Vec<Record> {
    content
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(Record::new)
        .collect()
}

/// Parse host list content, one worker per line.
///
/// Surrounding whitespace is stripped, blank lines and `#` comments are
/// skipped. A host listed twice is rejected since both entries would target
/// the same remote assignment file.
pub fn parse_hosts(content: &str) -> Result<Vec<Worker>, ConfigError> {
    let mut seen = HashSet::new();
    let mut workers = Vec::new();

    for line in content.lines() {
        let host = line.trim();
        if host.is_empty() || host.starts_with('#') {
            continue;
        }
        // Would be taken for an option by the transport.
        if host.starts_with('-') {
            return Err(ConfigError::Invalid {
                field: "host",
                reason: format!("'{host}' starts with '-'"),
            });
        }
        if !seen.insert(host.to_string()) {
            return Err(ConfigError::DuplicateHost(host.to_string()));
        }
        workers.push(Worker::new(host));
    }

    if workers.is_empty() {
        return Err(ConfigError::EmptyHostList);
    }
    Ok(workers)
}

pub async fn read_records(path: &Path) -> Result<Vec<Record>, ConfigError> {
    let content = read_to_string(path).await?;
    Ok(parse_records(&content))
}

pub async fn read_hosts(path: &Path) -> Result<Vec<Worker>, ConfigError> {
    let content = read_to_string(path).await?;
    parse_hosts(&content)
}

async fn read_to_string(path: &Path) -> Result<String, ConfigError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Shuffle the candidate records once and keep the first `n`.
///
/// With a seed the permutation is reproducible across runs.
pub fn sample(mut records: Vec<Record>, n: usize, seed: Option<u64>) -> Vec<Record> {
    match seed {
        Some(seed) => records.shuffle(&mut StdRng::seed_from_u64(seed)),
        None => records.shuffle(&mut rand::thread_rng()),
    }
    if n < records.len() {
        records.truncate(n);
    } else if n > records.len() {
        tracing::warn!(
            requested = n,
            available = records.len(),
            "Record list is shorter than the requested sample, using all records"
        );
    }
    records
}
