// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry, IntCounter,
    IntCounterVec, Registry,
};

/// Metrics reported by one analysis worker.
pub(crate) struct Metrics {
    /// Blocks whose memory tables have been computed, labelled by block kind.
    pub blocks_analyzed: IntCounterVec,
    /// Assertions generated by summary inference, labelled by kind.
    pub asserts_generated: IntCounterVec,
    /// Assertion checks resolved, labelled by report outcome.
    pub checks_resolved: IntCounterVec,
    /// Merge cache flushes that had to be retried after a stamp conflict.
    pub merge_flush_conflicts: IntCounter,
}

impl Metrics {
    pub(crate) fn new(registry: &Registry) -> Arc<Metrics> {
        Arc::new(Metrics {
            blocks_analyzed: register_int_counter_vec_with_registry!(
                "blocks_analyzed",
                "Blocks whose memory tables have been computed",
                &["kind"],
                registry,
            )
            .unwrap(),
            asserts_generated: register_int_counter_vec_with_registry!(
                "asserts_generated",
                "Assertions generated by summary inference",
                &["kind"],
                registry,
            )
            .unwrap(),
            checks_resolved: register_int_counter_vec_with_registry!(
                "checks_resolved",
                "Assertion checks resolved",
                &["report"],
                registry,
            )
            .unwrap(),
            merge_flush_conflicts: register_int_counter_with_registry!(
                "merge_flush_conflicts",
                "Merge cache flushes retried after a stamp conflict",
                registry,
            )
            .unwrap(),
        })
    }
}

pub(crate) fn test_metrics() -> Arc<Metrics> {
    Metrics::new(&Registry::new())
}
