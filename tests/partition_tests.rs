//! Tests for splitting records across worker groups.

mod test_harness;

use std::collections::HashSet;

use fleet_ingest::partition::record::{parse_hosts, parse_records, sample};
use fleet_ingest::partition::{partition, Record};
use test_harness::workers;

fn records(n: usize) -> Vec<Record> {
    (0..n).map(|i| Record::new(format!("img{i:05}.jpg {}", i % 10))).collect()
}

#[test]
fn test_non_replicate_splits_group_slice() {
    let records = records(1000);
    let plan = partition(&records, &workers(&["w0", "w1", "w2", "w3"]), 2, false).unwrap();

    assert_eq!(plan.groups(), 2);
    assert!(plan.assignments().iter().all(|a| a.records.len() == 250));
    assert_eq!(plan.total_assigned(), 1000);
    assert_eq!(plan.dropped_records(), 0);

    // Disjoint and covering.
    let seen: HashSet<&Record> = plan
        .assignments()
        .iter()
        .flat_map(|a| a.records.iter())
        .collect();
    assert_eq!(seen.len(), 1000);

    // Group 0 owns the first half in worker order.
    assert_eq!(plan.assignments()[0].records, records[0..250].to_vec());
    assert_eq!(plan.assignments()[1].records, records[250..500].to_vec());
    assert_eq!(plan.assignments()[2].records, records[500..750].to_vec());
}

#[test]
fn test_replicate_duplicates_group_slice() {
    let records = records(1000);
    let plan = partition(&records, &workers(&["w0", "w1", "w2", "w3"]), 2, true).unwrap();

    let a = plan.assignments();
    assert!(a.iter().all(|x| x.records.len() == 500));
    assert_eq!(a[0].records, a[1].records);
    assert_eq!(a[2].records, a[3].records);
    assert_ne!(a[0].records, a[2].records);
    assert_eq!(a[0].group, 0);
    assert_eq!(a[3].group, 1);
}

#[test]
fn test_trailing_worker_gets_nothing() {
    let plan = partition(
        &records(1000),
        &workers(&["w0", "w1", "w2", "w3", "w4"]),
        2,
        false,
    )
    .unwrap();

    assert_eq!(plan.len(), 4);
    assert_eq!(plan.unused_workers(), workers(&["w4"]).as_slice());
    assert!(plan.get(&workers(&["w4"])[0]).is_none());
}

#[test]
fn test_uneven_split_total_is_bounded() {
    // ngroups * floor(groupSize / m) * m <= len(records)
    for (n, hosts, m) in [(1001usize, 4usize, 2usize), (999, 6, 3), (7, 3, 1), (10, 4, 4)] {
        let names: Vec<String> = (0..hosts).map(|i| format!("w{i}")).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let plan = partition(&records(n), &workers(&refs), m, false).unwrap();

        let ngroups = hosts / m;
        let per_group = n / ngroups;
        assert_eq!(plan.total_assigned(), ngroups * (per_group / m) * m);
        assert!(plan.total_assigned() <= n);
        assert_eq!(plan.total_assigned() + plan.dropped_records(), n);
    }
}

#[test]
fn test_partition_is_deterministic() {
    let records = records(321);
    let hosts = workers(&["a", "b", "c", "d", "e", "f"]);
    let first = partition(&records, &hosts, 3, false).unwrap();
    let second = partition(&records, &hosts, 3, false).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_seeded_sample_is_reproducible() {
    let a = sample(records(100), 40, Some(11));
    let b = sample(records(100), 40, Some(11));
    assert_eq!(a, b);
    assert_eq!(a.len(), 40);
    assert_ne!(a, records(100)[..40].to_vec());
}

#[test]
fn test_inputs_parse_into_plan() {
    let records = parse_records("a.jpg 1\n\nb.jpg 2\r\nc.jpg 3\nd.jpg 4\n");
    let hosts = parse_hosts("# fleet\nnode1\nnode2\n\n").unwrap();
    let plan = partition(&records, &hosts, 1, true).unwrap();

    assert_eq!(records.len(), 4);
    assert_eq!(plan.assignments()[0].records[1].as_str(), "b.jpg 2");
    assert_eq!(plan.assignments()[1].worker.host(), "node2");
}
