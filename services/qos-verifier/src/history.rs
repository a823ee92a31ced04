// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Bounded history of completed operations

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::PnfsId;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub when: DateTime<Utc>,
    pub pnfs_id: PnfsId,
    pub summary: String,
    pub failed: bool,
}

/// Circular buffers of recent completions, with an errors-only view
#[derive(Debug)]
pub struct QoSHistory {
    capacity: usize,
    entries: Mutex<VecDeque<HistoryEntry>>,
    errors: Mutex<VecDeque<HistoryEntry>>,
}

fn push_bounded(deque: &Mutex<VecDeque<HistoryEntry>>, capacity: usize, entry: HistoryEntry) {
    let mut deque = deque.lock().unwrap_or_else(|e| e.into_inner());
    if deque.len() == capacity {
        deque.pop_front();
    }
    deque.push_back(entry);
}

impl QoSHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            errors: Mutex::new(VecDeque::new()),
        }
    }

    pub fn add(&self, pnfs_id: PnfsId, summary: String, failed: bool) {
        let entry = HistoryEntry {
            when: Utc::now(),
            pnfs_id,
            summary,
            failed,
        };
        if failed {
            push_bounded(&self.errors, self.capacity, entry.clone());
        }
        push_bounded(&self.entries, self.capacity, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent first
    pub fn ascii(&self, limit: usize, errors_only: bool) -> String {
        let source = if errors_only { &self.errors } else { &self.entries };
        let deque = source.lock().unwrap_or_else(|e| e.into_inner());
        deque
            .iter()
            .rev()
            .take(limit)
            .map(|e| format!("{} {}", e.when.to_rfc3339(), e.summary))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_enforced() {
        let history = QoSHistory::new(3);
        for i in 0..5 {
            history.add(format!("{:08}", i).as_str().into(), format!("op {}", i), false);
        }
        assert_eq!(history.len(), 3);
        let dump = history.ascii(10, false);
        assert!(dump.contains("op 4"));
        assert!(!dump.contains("op 1"));
    }

    #[test]
    fn errors_view_holds_failures_only() {
        let history = QoSHistory::new(10);
        history.add("AAAA".into(), "ok".to_string(), false);
        history.add("BBBB".into(), "bad".to_string(), true);

        let errors = history.ascii(10, true);
        assert!(errors.contains("bad"));
        assert!(!errors.contains("ok"));

        let all = history.ascii(10, false);
        assert!(all.contains("ok"));
        assert!(all.contains("bad"));
    }

    #[test]
    fn newest_entries_come_first() {
        let history = QoSHistory::new(10);
        history.add("AAAA".into(), "first".to_string(), false);
        history.add("BBBB".into(), "second".to_string(), false);
        let dump = history.ascii(1, false);
        assert!(dump.contains("second"));
        assert!(!dump.contains("first"));
    }
}
