// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Advisory per-flow counters. Nothing in the engine depends on their values.

use {
    crate::window::BA_WINDOW_CAPACITY,
    serde::{Deserialize, Serialize},
    std::sync::atomic::{AtomicU64, Ordering},
};

pub struct FlowStats {
    aggregates: AtomicU64,
    mpdus: AtomicU64,
    retry_aggregates: AtomicU64,
    retries: AtomicU64,
    discards: AtomicU64,
    acked: AtomicU64,
    ba_reports: AtomicU64,
    no_ba_reports: AtomicU64,
    desyncs: AtomicU64,
    singletons: AtomicU64,
    // Aggregates sent, bucketed by MPDU count.
    aggregate_sizes: [AtomicU64; BA_WINDOW_CAPACITY + 1],
}

/// Point-in-time copy of `FlowStats`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStatsSnapshot {
    pub aggregates: u64,
    pub mpdus: u64,
    pub retry_aggregates: u64,
    pub retries: u64,
    pub discards: u64,
    pub acked: u64,
    pub ba_reports: u64,
    pub no_ba_reports: u64,
    pub desyncs: u64,
    pub singletons: u64,
    pub aggregate_sizes: Vec<u64>,
}

impl Default for FlowStats {
    fn default() -> Self {
        Self {
            aggregates: AtomicU64::new(0),
            mpdus: AtomicU64::new(0),
            retry_aggregates: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            discards: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            ba_reports: AtomicU64::new(0),
            no_ba_reports: AtomicU64::new(0),
            desyncs: AtomicU64::new(0),
            singletons: AtomicU64::new(0),
            aggregate_sizes: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl FlowStats {
    pub fn record_aggregate(&self, mpdus: usize) {
        bump(&self.aggregates, 1);
        bump(&self.mpdus, mpdus as u64);
        if let Some(bucket) = self.aggregate_sizes.get(mpdus) {
            bump(bucket, 1);
        }
    }

    pub fn record_retry_aggregate(&self) {
        bump(&self.retry_aggregates, 1);
    }

    pub fn record_retry(&self) {
        bump(&self.retries, 1);
    }

    pub fn record_discards(&self, n: usize) {
        bump(&self.discards, n as u64);
    }

    pub fn record_ba_report(&self, acked: usize) {
        bump(&self.ba_reports, 1);
        bump(&self.acked, acked as u64);
    }

    pub fn record_no_ba(&self) {
        bump(&self.no_ba_reports, 1);
    }

    pub fn record_desync(&self) {
        bump(&self.desyncs, 1);
    }

    pub fn record_singleton(&self) {
        bump(&self.singletons, 1);
    }

    pub fn reset(&self) {
        for counter in [
            &self.aggregates,
            &self.mpdus,
            &self.retry_aggregates,
            &self.retries,
            &self.discards,
            &self.acked,
            &self.ba_reports,
            &self.no_ba_reports,
            &self.desyncs,
            &self.singletons,
        ]
        .into_iter()
        .chain(self.aggregate_sizes.iter())
        {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> FlowStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        FlowStatsSnapshot {
            aggregates: load(&self.aggregates),
            mpdus: load(&self.mpdus),
            retry_aggregates: load(&self.retry_aggregates),
            retries: load(&self.retries),
            discards: load(&self.discards),
            acked: load(&self.acked),
            ba_reports: load(&self.ba_reports),
            no_ba_reports: load(&self.no_ba_reports),
            desyncs: load(&self.desyncs),
            singletons: load(&self.singletons),
            aggregate_sizes: self.aggregate_sizes.iter().map(load).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_reset() {
        let stats = FlowStats::default();
        stats.record_aggregate(10);
        stats.record_aggregate(10);
        stats.record_ba_report(7);
        stats.record_discards(2);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.aggregates, 2);
        assert_eq!(snapshot.mpdus, 20);
        assert_eq!(snapshot.aggregate_sizes[10], 2);
        assert_eq!(snapshot.acked, 7);
        assert_eq!(snapshot.discards, 2);

        stats.reset();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.aggregates, 0);
        assert_eq!(snapshot.aggregate_sizes[10], 0);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let stats = FlowStats::default();
        stats.record_no_ba();
        let json = serde_json::to_value(stats.snapshot()).expect("serializable snapshot");
        assert_eq!(json["no_ba_reports"], 1);
        assert_eq!(json["aggregate_sizes"].as_array().map(Vec::len), Some(BA_WINDOW_CAPACITY + 1));
    }
}
