// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Bookkeeping for batched pool scans
//!
//! A pool scan injects one operation per file; the scanner wants progress
//! in batches and a single completion notification per scan, not one
//! message per file. Records are keyed by the parent pool.

use std::collections::HashMap;
use std::sync::Mutex;

/// Progress counters for one pool scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRecord {
    pub pool: String,
    pub arrived: u64,
    pub completed: u64,
    pub failed: u64,
    /// Set once the scanner has injected the last file of the scan
    pub finished_arriving: bool,
}

impl ScanRecord {
    pub fn is_complete(&self) -> bool {
        self.finished_arriving && self.completed >= self.arrived
    }
}

/// One progress notification, emitted per completed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanProgress {
    pub pool: String,
    pub arrived: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug)]
pub struct VerifyScanRecordMap {
    records: Mutex<ScanRecords>,
    batch_size: u64,
}

#[derive(Debug, Default)]
struct ScanRecords {
    by_pool: HashMap<String, ScanRecord>,
    /// completed count at the last notification, per pool
    notified_at: HashMap<String, u64>,
}

fn lock(records: &Mutex<ScanRecords>) -> std::sync::MutexGuard<'_, ScanRecords> {
    records.lock().unwrap_or_else(|e| e.into_inner())
}

impl VerifyScanRecordMap {
    pub fn new(batch_size: u64) -> Self {
        Self {
            records: Mutex::new(ScanRecords::default()),
            batch_size: batch_size.max(1),
        }
    }

    /// One more operation arrived for the pool's scan
    pub fn update_arrived(&self, pool: &str) {
        let mut records = lock(&self.records);
        let record = records
            .by_pool
            .entry(pool.to_string())
            .or_insert_with(|| ScanRecord {
                pool: pool.to_string(),
                ..Default::default()
            });
        record.arrived += 1;
    }

    /// The scanner injected the last file of the pool's scan
    pub fn finish_arriving(&self, pool: &str) {
        let mut records = lock(&self.records);
        if let Some(record) = records.by_pool.get_mut(pool) {
            record.finished_arriving = true;
        }
    }

    /// One of the pool's operations completed (or aborted, when `failed`)
    pub fn update_completed(&self, pool: &str, failed: bool) {
        let mut records = lock(&self.records);
        if let Some(record) = records.by_pool.get_mut(pool) {
            record.completed += 1;
            if failed {
                record.failed += 1;
            }
        }
    }

    /// Progress notification once per completed batch
    pub fn check_for_notify(&self, pool: &str) -> Option<ScanProgress> {
        let mut records = lock(&self.records);
        let record = records.by_pool.get(pool)?.clone();
        let last = records.notified_at.get(pool).copied().unwrap_or(0);
        if record.completed < last + self.batch_size {
            return None;
        }
        records.notified_at.insert(pool.to_string(), record.completed);
        Some(ScanProgress {
            pool: record.pool,
            arrived: record.arrived,
            completed: record.completed,
            failed: record.failed,
        })
    }

    /// Retire and return the record once the scan is fully complete
    pub fn fetch_and_remove_if_completed(&self, pool: &str) -> Option<ScanRecord> {
        let mut records = lock(&self.records);
        let complete = records.by_pool.get(pool).is_some_and(ScanRecord::is_complete);
        if !complete {
            return None;
        }
        records.notified_at.remove(pool);
        records.by_pool.remove(pool)
    }

    /// Drop the record for a canceled scan
    pub fn cancel(&self, pool: &str) -> Option<ScanRecord> {
        let mut records = lock(&self.records);
        records.notified_at.remove(pool);
        records.by_pool.remove(pool)
    }

    pub fn get(&self, pool: &str) -> Option<ScanRecord> {
        lock(&self.records).by_pool.get(pool).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).by_pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
