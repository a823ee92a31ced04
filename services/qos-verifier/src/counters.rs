// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Cumulative statistics for the verifier

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::types::{QoSAction, QoSMessageType};

#[derive(Debug, Clone, Copy, Default)]
pub struct SweepStats {
    pub last_sweep: Option<DateTime<Utc>>,
    pub last_duration: Duration,
    pub sweeps: u64,
}

#[derive(Debug, Default)]
struct CounterMaps {
    received: HashMap<QoSMessageType, u64>,
    completed_by_action: HashMap<QoSAction, u64>,
    completed_by_pool: HashMap<String, u64>,
    failed_by_pool: HashMap<String, u64>,
}

/// Totals since startup; all methods are callable from any task
#[derive(Debug, Default)]
pub struct QoSVerifierCounters {
    maps: Mutex<CounterMaps>,
    sweeps: Mutex<SweepStats>,
    total_completed: AtomicU64,
    total_failed: AtomicU64,
}

fn maps_lock(maps: &Mutex<CounterMaps>) -> std::sync::MutexGuard<'_, CounterMaps> {
    maps.lock().unwrap_or_else(|e| e.into_inner())
}

impl QoSVerifierCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_received(&self, message_type: QoSMessageType) {
        *maps_lock(&self.maps).received.entry(message_type).or_insert(0) += 1;
    }

    /// A completed operation, counted against the action that changed the
    /// file and against the source and target pools it involved
    pub fn increment_completed(
        &self,
        source: Option<&str>,
        target: Option<&str>,
        action: Option<QoSAction>,
    ) {
        self.total_completed.fetch_add(1, Ordering::Relaxed);
        let mut maps = maps_lock(&self.maps);
        if let Some(action) = action {
            *maps.completed_by_action.entry(action).or_insert(0) += 1;
        }
        for pool in [source, target].into_iter().flatten() {
            *maps.completed_by_pool.entry(pool.to_string()).or_insert(0) += 1;
        }
    }

    /// A failed (aborted) operation, attributed to the pool at fault if known
    pub fn increment_failed(&self, pool: Option<&str>) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
        if let Some(pool) = pool {
            *maps_lock(&self.maps)
                .failed_by_pool
                .entry(pool.to_string())
                .or_insert(0) += 1;
        }
    }

    pub fn record_sweep(&self, when: DateTime<Utc>, elapsed: Duration) {
        let mut sweeps = self.sweeps.lock().unwrap_or_else(|e| e.into_inner());
        sweeps.last_sweep = Some(when);
        sweeps.last_duration = elapsed;
        sweeps.sweeps += 1;
    }

    pub fn total_completed(&self) -> u64 {
        self.total_completed.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.total_failed.load(Ordering::Relaxed)
    }

    pub fn received(&self, message_type: QoSMessageType) -> u64 {
        maps_lock(&self.maps)
            .received
            .get(&message_type)
            .copied()
            .unwrap_or(0)
    }

    pub fn completed_for(&self, action: QoSAction) -> u64 {
        maps_lock(&self.maps)
            .completed_by_action
            .get(&action)
            .copied()
            .unwrap_or(0)
    }

    pub fn completed_for_pool(&self, pool: &str) -> u64 {
        maps_lock(&self.maps)
            .completed_by_pool
            .get(pool)
            .copied()
            .unwrap_or(0)
    }

    pub fn failed_for(&self, pool: &str) -> u64 {
        maps_lock(&self.maps)
            .failed_by_pool
            .get(pool)
            .copied()
            .unwrap_or(0)
    }

    pub fn sweep_stats(&self) -> SweepStats {
        *self.sweeps.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Plain-text rendering for info output
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "completed {} failed {}",
            self.total_completed(),
            self.total_failed()
        );
        let maps = maps_lock(&self.maps);
        let mut received: Vec<_> = maps.received.iter().collect();
        received.sort_by_key(|(t, _)| t.to_string());
        for (message_type, count) in received {
            let _ = writeln!(out, "received {:<24} {}", message_type.to_string(), count);
        }
        let mut completed: Vec<_> = maps.completed_by_action.iter().collect();
        completed.sort_by_key(|(a, _)| a.to_string());
        for (action, count) in completed {
            let _ = writeln!(out, "action   {:<24} {}", action.to_string(), count);
        }
        let mut by_pool: Vec<_> = maps.completed_by_pool.iter().collect();
        by_pool.sort_by_key(|(p, _)| p.as_str());
        for (pool, count) in by_pool {
            let _ = writeln!(out, "pool     {:<24} {}", pool, count);
        }
        let mut failed: Vec<_> = maps.failed_by_pool.iter().collect();
        failed.sort_by_key(|(p, _)| p.as_str());
        for (pool, count) in failed {
            let _ = writeln!(out, "failed   {:<24} {}", pool, count);
        }
        drop(maps);
        let sweeps = self.sweep_stats();
        if let Some(last) = sweeps.last_sweep {
            let _ = writeln!(
                out,
                "sweeps {} last {} ({} ms)",
                sweeps.sweeps,
                last.to_rfc3339(),
                sweeps.last_duration.as_millis()
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = QoSVerifierCounters::new();
        counters.increment_received(QoSMessageType::AddCacheLocation);
        counters.increment_received(QoSMessageType::AddCacheLocation);
        counters.increment_received(QoSMessageType::SystemScan);
        counters.increment_completed(Some("pool-a"), Some("pool-b"), Some(QoSAction::CopyReplica));
        counters.increment_completed(None, None, None);
        counters.increment_failed(Some("pool-a"));

        assert_eq!(counters.received(QoSMessageType::AddCacheLocation), 2);
        assert_eq!(counters.received(QoSMessageType::SystemScan), 1);
        assert_eq!(counters.received(QoSMessageType::CorruptFile), 0);
        assert_eq!(counters.completed_for(QoSAction::CopyReplica), 1);
        assert_eq!(counters.completed_for_pool("pool-a"), 1);
        assert_eq!(counters.completed_for_pool("pool-b"), 1);
        assert_eq!(counters.completed_for_pool("pool-c"), 0);
        assert_eq!(counters.total_completed(), 2);
        assert_eq!(counters.total_failed(), 1);
        assert_eq!(counters.failed_for("pool-a"), 1);
    }

    #[test]
    fn report_mentions_everything() {
        let counters = QoSVerifierCounters::new();
        counters.increment_received(QoSMessageType::QosModified);
        counters.increment_completed(Some("pool-y"), None, Some(QoSAction::Flush));
        counters.increment_failed(Some("pool-z"));
        counters.record_sweep(Utc::now(), Duration::from_millis(12));

        let report = counters.report();
        assert!(report.contains("qos_modified"));
        assert!(report.contains("flush"));
        assert!(report.contains("pool-y"));
        assert!(report.contains("pool-z"));
        assert!(report.contains("sweeps 1"));
    }
}
