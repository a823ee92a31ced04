// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Prometheus metrics for the verifier
//!
//! Exports metrics for monitoring scheduler behavior:
//! - operations completed / aborted
//! - store operation failures (when persistence calls fail)

use prometheus::{Counter, Opts, Registry, TextEncoder};

// Static metric initialization uses expect because these are compile-time
// constant definitions that cannot fail in practice. If they do fail, it
// indicates a programming error (e.g., invalid metric name) that should
// cause a panic at startup.
//
// This module exists to scope the clippy allow attributes to just the
// metric definitions.
#[allow(clippy::expect_used)]
mod metrics_impl {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        /// Registry for all verifier metrics
        pub static ref REGISTRY: Registry = Registry::new();

        /// Operations that reached DONE and were removed
        pub static ref OPERATIONS_COMPLETED: Counter = Counter::with_opts(
            Opts::new(
                "qos_verifier_operations_completed_total",
                "Total verification operations completed successfully"
            )
        ).expect("valid metric name");

        /// Operations aborted after exhausting the retry policy
        pub static ref OPERATIONS_ABORTED: Counter = Counter::with_opts(
            Opts::new(
                "qos_verifier_operations_aborted_total",
                "Total verification operations aborted as fatal"
            )
        ).expect("valid metric name");

        /// Failed store calls (insert / update / delete)
        ///
        /// The in-memory operation is still consistent when these fire; only
        /// crash recovery fidelity is degraded.
        pub static ref DB_OPERATION_FAILURES: Counter = Counter::with_opts(
            Opts::new(
                "qos_verifier_db_operation_failures_total",
                "Total store operation failures"
            )
        ).expect("valid metric name");
    }
}

pub use metrics_impl::{DB_OPERATION_FAILURES, OPERATIONS_ABORTED, OPERATIONS_COMPLETED, REGISTRY};

/// Register all metrics with the registry
///
/// Should be called once during application startup.
/// Panics if registration fails (indicates a programming error).
#[allow(clippy::expect_used)]
pub fn register_metrics() {
    REGISTRY
        .register(Box::new(OPERATIONS_COMPLETED.clone()))
        .expect("Failed to register OPERATIONS_COMPLETED");
    REGISTRY
        .register(Box::new(OPERATIONS_ABORTED.clone()))
        .expect("Failed to register OPERATIONS_ABORTED");
    REGISTRY
        .register(Box::new(DB_OPERATION_FAILURES.clone()))
        .expect("Failed to register DB_OPERATION_FAILURES");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

pub fn record_operation_completed() {
    OPERATIONS_COMPLETED.inc();
}

pub fn record_operation_aborted() {
    OPERATIONS_ABORTED.inc();
}

/// Record a store operation failure
pub fn record_db_operation_failure() {
    DB_OPERATION_FAILURES.inc();
}
