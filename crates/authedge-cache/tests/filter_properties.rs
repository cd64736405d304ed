//! Statistical properties of the permission filter at production sizing.

use authedge_cache::{FilterConfig, FilterVerdict, PermissionFilter};
use authedge_core::{Action, PermissionKey};

const N: usize = 1_000_000;

fn granted(i: usize) -> PermissionKey {
    PermissionKey::new(
        format!("tenant-{}", i % 97),
        format!("user-{i}"),
        format!("/api/resources/{i}"),
        Action::Read,
    )
}

fn never_granted(i: usize) -> PermissionKey {
    PermissionKey::new(
        format!("tenant-{}", i % 97),
        format!("user-{i}"),
        format!("/api/resources/{i}"),
        Action::Delete,
    )
}

fn built_filter() -> PermissionFilter {
    let filter = PermissionFilter::new(FilterConfig::default(), "gw-props");
    let generation = filter.request_rebuild();
    assert!(filter.rebuild(generation, (0..N).map(granted)));
    filter
}

#[test]
fn no_false_negatives_and_bounded_false_positives() {
    let filter = built_filter();

    let missing = (0..N)
        .filter(|i| filter.might_exist(&granted(*i)) != FilterVerdict::MaybePresent)
        .count();
    assert_eq!(missing, 0, "inserted keys must never probe absent");

    let false_positives = (0..N)
        .filter(|i| filter.might_exist(&never_granted(*i)) == FilterVerdict::MaybePresent)
        .count();
    let rate = false_positives as f64 / N as f64;
    assert!(rate < 0.001, "false positive rate {rate} exceeds 0.1%");

    let stats = filter.stats();
    assert_eq!(stats.entries, N as u64);
    assert!(stats.estimated_false_positive_rate < 0.001);
}

#[test]
fn removed_keys_do_not_disturb_survivors() {
    let filter = PermissionFilter::new(
        FilterConfig {
            expected_insertions: 10_000,
            removal_burst_threshold: u32::MAX,
            ..FilterConfig::default()
        },
        "gw-props",
    );
    let generation = filter.request_rebuild();
    filter.rebuild(generation, (0..10_000).map(granted));

    for i in (0..10_000).step_by(2) {
        assert!(filter.remove(&granted(i)));
    }
    for i in (1..10_000).step_by(2) {
        assert_eq!(filter.might_exist(&granted(i)), FilterVerdict::MaybePresent);
    }
    assert!(filter.is_ready());
}
