//! Lookups over `metrics-util` debugging snapshots.
//!
//! Each lookup takes a fresh snapshot; counters and gauges keep their values
//! across snapshots.

use metrics_util::debugging::{DebugValue, Snapshotter};

fn has_labels(key: &metrics::Key, labels: &[(&str, &str)]) -> bool {
    labels.iter().all(|(name, value)| {
        key.labels()
            .any(|label| label.key() == *name && label.value() == *value)
    })
}

/// Sum of counters named `name` carrying every label in `labels`.
#[must_use]
pub fn counter_value(snapshotter: &Snapshotter, name: &str, labels: &[(&str, &str)]) -> u64 {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(key, _, _, _)| key.key().name() == name && has_labels(key.key(), labels))
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(count) => count,
            _ => 0,
        })
        .sum()
}

/// Last value of the gauge named `name`, if recorded.
#[must_use]
pub fn gauge_value(snapshotter: &Snapshotter, name: &str) -> Option<f64> {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .find(|(key, _, _, _)| key.key().name() == name)
        .and_then(|(_, _, _, value)| match value {
            DebugValue::Gauge(gauge) => Some(gauge.into_inner()),
            _ => None,
        })
}
