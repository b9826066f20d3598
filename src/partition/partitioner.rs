use serde::Serialize;

use crate::error::ConfigError;
use crate::partition::record::{Record, Worker};

/// The record list one worker is responsible for fetching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub worker: Worker,
    /// Index of the worker's group.
    pub group: usize,
    pub records: Vec<Record>,
}

/// Per-worker assignments in host-list order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionPlan {
    assignments: Vec<Assignment>,
    unused: Vec<Worker>,
    group_size: usize,
    records_per_group: usize,
    dropped: usize,
}

impl PartitionPlan {
    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    pub fn get(&self, worker: &Worker) -> Option<&Assignment> {
        self.assignments.iter().find(|a| &a.worker == worker)
    }

    /// Trailing workers left out because they do not fill a whole group.
    pub fn unused_workers(&self) -> &[Worker] {
        &self.unused
    }

    /// Workers per group.
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn groups(&self) -> usize {
        if self.group_size == 0 {
            0
        } else {
            self.assignments.len() / self.group_size
        }
    }

    /// Length of each group's slice of the record list.
    pub fn records_per_group(&self) -> usize {
        self.records_per_group
    }

    /// Records that ended up in no assignment because of floor division.
    pub fn dropped_records(&self) -> usize {
        self.dropped
    }

    /// Sum of assignment lengths, replicas counted separately.
    pub fn total_assigned(&self) -> usize {
        self.assignments.iter().map(|a| a.records.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// Split `records` across `workers` in groups of `group_size`.
///
/// Groups are contiguous runs of `group_size` workers in host-list order;
/// workers past the last full group get nothing. Each group receives a
/// contiguous, floor-divided slice of `records`. With `replicate` every worker
/// of the group holds the whole slice, otherwise the slice is cut into
/// `group_size` floor-divided chunks in worker order. Remainders are dropped
/// at both divisions.
///
/// The function is pure; shuffling is the caller's job.
pub fn partition(
    records: &[Record],
    workers: &[Worker],
    group_size: usize,
    replicate: bool,
) -> Result<PartitionPlan, ConfigError> {
    if group_size == 0 {
        return Err(ConfigError::ZeroGroupSize);
    }
    if workers.len() < group_size {
        return Err(ConfigError::NotEnoughWorkers {
            group_size,
            workers: workers.len(),
        });
    }

    let ngroups = workers.len() / group_size;
    let per_group = records.len() / ngroups;
    let per_worker = per_group / group_size;

    let mut assignments = Vec::with_capacity(ngroups * group_size);
    for g in 0..ngroups {
        let group_records = &records[g * per_group..(g + 1) * per_group];
        let members = &workers[g * group_size..(g + 1) * group_size];

        for (k, worker) in members.iter().enumerate() {
            let slice = if replicate {
                group_records
            } else {
                &group_records[k * per_worker..(k + 1) * per_worker]
            };
            assignments.push(Assignment {
                worker: worker.clone(),
                group: g,
                records: slice.to_vec(),
            });
        }
    }

    let covered = if replicate {
        ngroups * per_group
    } else {
        ngroups * per_worker * group_size
    };

    Ok(PartitionPlan {
        assignments,
        unused: workers[ngroups * group_size..].to_vec(),
        group_size,
        records_per_group: per_group,
        dropped: records.len() - covered,
    })
}
