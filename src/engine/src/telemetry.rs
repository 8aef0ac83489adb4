//! Engine metrics.
//!
//! Labeled counters and gauges kept behind a process-wide collector. Every
//! counter is pre-initialized to zero for each observed label set, so an
//! exporter can distinguish "never happened" from "not yet scraped".

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Counter names.
pub const TAG_SYNC_ERRORS: &str = "tag_sync_errors";
pub const IMAGE_SYNC_ERRORS: &str = "image_sync_errors";
pub const PURGE_ERRORS: &str = "purge_errors";
pub const PUSHES: &str = "pushes";
pub const UPLOADED_BYTES: &str = "uploaded_bytes";
pub const DOWNLOADED_BYTES: &str = "downloaded_bytes";

/// Gauge names.
pub const MONITORED_IMAGES: &str = "monitored_images";
pub const MONITORED_TAGS: &str = "monitored_tags";

/// Sorted label set; `BTreeMap` keeps the key order stable for lookups.
pub type Labels = BTreeMap<String, String>;

/// Build a label set from `(key, value)` pairs.
pub fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Default)]
struct MetricsInner {
    counters: BTreeMap<(String, Labels), u64>,
    gauges: BTreeMap<(String, Labels), i64>,
}

/// Process-wide metrics collector.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<RwLock<MetricsInner>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a counter exists at zero for this label set.
    pub fn init_counter(&self, name: &str, labels: Labels) {
        let mut inner = self.inner.write().expect("metrics lock poisoned");
        inner.counters.entry((name.to_string(), labels)).or_insert(0);
    }

    /// Add to a counter, creating it if needed.
    pub fn add_counter(&self, name: &str, labels: Labels, delta: u64) {
        let mut inner = self.inner.write().expect("metrics lock poisoned");
        *inner.counters.entry((name.to_string(), labels)).or_insert(0) += delta;
    }

    /// Set a gauge.
    pub fn set_gauge(&self, name: &str, labels: Labels, value: i64) {
        let mut inner = self.inner.write().expect("metrics lock poisoned");
        inner.gauges.insert((name.to_string(), labels), value);
    }

    /// Read one counter. Missing series read as zero.
    pub fn counter(&self, name: &str, labels: &Labels) -> u64 {
        self.inner
            .read()
            .expect("metrics lock poisoned")
            .counters
            .get(&(name.to_string(), labels.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Sum a counter across all label sets.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.inner
            .read()
            .expect("metrics lock poisoned")
            .counters
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, v)| v)
            .sum()
    }

    /// Read one gauge.
    pub fn gauge(&self, name: &str, labels: &Labels) -> Option<i64> {
        self.inner
            .read()
            .expect("metrics lock poisoned")
            .gauges
            .get(&(name.to_string(), labels.clone()))
            .copied()
    }

    /// Snapshot every series for an exporter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().expect("metrics lock poisoned");
        MetricsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
        }
    }

    /// Clear everything. Test hook.
    pub fn reset(&self) {
        let mut inner = self.inner.write().expect("metrics lock poisoned");
        inner.counters.clear();
        inner.gauges.clear();
    }

    // Domain helpers so call sites stay terse.

    pub fn init_tag_sync_errors(&self, image: &str, tag: &str) {
        self.init_counter(TAG_SYNC_ERRORS, labels(&[("image", image), ("tag", tag)]));
    }

    pub fn tag_sync_error(&self, image: &str, tag: &str, error: &str) {
        self.add_counter(
            TAG_SYNC_ERRORS,
            labels(&[("image", image), ("tag", tag), ("error", error)]),
            1,
        );
    }

    pub fn image_sync_error(&self, image: &str, error: &str) {
        self.add_counter(
            IMAGE_SYNC_ERRORS,
            labels(&[("image", image), ("error", error)]),
            1,
        );
    }

    pub fn init_purge_errors(&self, image: &str, tag: &str, target: &str) {
        self.init_counter(
            PURGE_ERRORS,
            labels(&[("image", image), ("tag", tag), ("target", target)]),
        );
    }

    pub fn purge_error(&self, image: &str, target: &str, error: &str) {
        self.add_counter(
            PURGE_ERRORS,
            labels(&[("image", image), ("target", target), ("error", error)]),
            1,
        );
    }

    pub fn tag_purge_error(&self, image: &str, tag: &str, target: &str, error: &str) {
        self.add_counter(
            PURGE_ERRORS,
            labels(&[
                ("image", image),
                ("tag", tag),
                ("target", target),
                ("error", error),
            ]),
            1,
        );
    }

    pub fn push(&self, image: &str, tag: &str, target: &str) {
        self.add_counter(
            PUSHES,
            labels(&[("image", image), ("tag", tag), ("target", target)]),
            1,
        );
    }

    pub fn uploaded_bytes(&self, destination: &str, kind: TransferKind, bytes: u64) {
        self.add_counter(
            UPLOADED_BYTES,
            labels(&[("destination", destination), ("type", kind.as_str())]),
            bytes,
        );
    }

    pub fn downloaded_bytes(&self, source: &str, kind: TransferKind, bytes: u64) {
        self.add_counter(
            DOWNLOADED_BYTES,
            labels(&[("source", source), ("type", kind.as_str())]),
            bytes,
        );
    }

    pub fn set_monitored_images(&self, count: i64) {
        self.set_gauge(MONITORED_IMAGES, Labels::new(), count);
    }

    pub fn set_monitored_tags(&self, image: &str, count: i64) {
        self.set_gauge(MONITORED_TAGS, labels(&[("image", image)]), count);
    }
}

/// Transport flavor for the byte counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Oci,
    S3,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Oci => "oci",
            TransferKind::S3 => "s3",
        }
    }
}

/// Point-in-time copy of every series.
pub struct MetricsSnapshot {
    pub counters: BTreeMap<(String, Labels), u64>,
    pub gauges: BTreeMap<(String, Labels), i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_starts_at_zero() {
        let metrics = Metrics::new();
        metrics.init_tag_sync_errors("alpine", "3.19");

        let l = labels(&[("image", "alpine"), ("tag", "3.19")]);
        assert_eq!(metrics.counter(TAG_SYNC_ERRORS, &l), 0);

        // The zero series is visible in the snapshot
        let snapshot = metrics.snapshot();
        assert!(snapshot
            .counters
            .contains_key(&(TAG_SYNC_ERRORS.to_string(), l)));
    }

    #[test]
    fn test_add_counter() {
        let metrics = Metrics::new();
        metrics.push("alpine", "3.19", "ghcr.io/mirror/alpine");
        metrics.push("alpine", "3.19", "ghcr.io/mirror/alpine");

        let l = labels(&[
            ("image", "alpine"),
            ("tag", "3.19"),
            ("target", "ghcr.io/mirror/alpine"),
        ]);
        assert_eq!(metrics.counter(PUSHES, &l), 2);
    }

    #[test]
    fn test_counter_total_across_labels() {
        let metrics = Metrics::new();
        metrics.push("alpine", "3.18", "a");
        metrics.push("alpine", "3.19", "a");
        metrics.push("busybox", "1.36", "b");

        assert_eq!(metrics.counter_total(PUSHES), 3);
        assert_eq!(metrics.counter_total(TAG_SYNC_ERRORS), 0);
    }

    #[test]
    fn test_byte_counters() {
        let metrics = Metrics::new();
        metrics.uploaded_bytes("s3:us-east-1:b:repo", TransferKind::S3, 100);
        metrics.uploaded_bytes("s3:us-east-1:b:repo", TransferKind::S3, 50);
        metrics.downloaded_bytes("docker.io/library/alpine", TransferKind::Oci, 10);

        let up = labels(&[("destination", "s3:us-east-1:b:repo"), ("type", "s3")]);
        assert_eq!(metrics.counter(UPLOADED_BYTES, &up), 150);

        let down = labels(&[("source", "docker.io/library/alpine"), ("type", "oci")]);
        assert_eq!(metrics.counter(DOWNLOADED_BYTES, &down), 10);
    }

    #[test]
    fn test_gauges() {
        let metrics = Metrics::new();
        metrics.set_monitored_images(3);
        metrics.set_monitored_tags("alpine", 12);

        assert_eq!(metrics.gauge(MONITORED_IMAGES, &Labels::new()), Some(3));
        assert_eq!(
            metrics.gauge(MONITORED_TAGS, &labels(&[("image", "alpine")])),
            Some(12)
        );

        metrics.set_monitored_images(1);
        assert_eq!(metrics.gauge(MONITORED_IMAGES, &Labels::new()), Some(1));
    }

    #[test]
    fn test_reset() {
        let metrics = Metrics::new();
        metrics.push("a", "t", "d");
        metrics.set_monitored_images(1);
        metrics.reset();

        assert_eq!(metrics.counter_total(PUSHES), 0);
        assert_eq!(metrics.gauge(MONITORED_IMAGES, &Labels::new()), None);
    }

    #[test]
    fn test_shared_across_clones() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.push("a", "t", "d");

        assert_eq!(metrics.counter_total(PUSHES), 1);
    }
}
