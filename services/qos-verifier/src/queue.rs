// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Per-message-type scheduling queues
//!
//! Queues hold pnfsids only; the manager's operation map is the single
//! source of truth for operation state. Each queue bounds the number of
//! RUNNING operations of its message types, with a WAITING deque for
//! operations parked on an external stage request (a parked operation does
//! not consume a running slot).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

use crate::types::{PnfsId, QoSMessageType};

/// The five queues, one per family of message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// ADD_CACHE_LOCATION
    Add,
    /// CLEAR_CACHE_LOCATION, CORRUPT_FILE
    Clr,
    /// POOL_STATUS_DOWN, POOL_STATUS_UP
    Pls,
    /// QOS_MODIFIED, QOS_MODIFIED_CANCELED, VALIDATE_ONLY
    Mod,
    /// SYSTEM_SCAN
    Sys,
}

pub const QUEUE_COUNT: usize = 5;

impl QueueKind {
    pub const ALL: [QueueKind; QUEUE_COUNT] = [
        QueueKind::Add,
        QueueKind::Clr,
        QueueKind::Pls,
        QueueKind::Mod,
        QueueKind::Sys,
    ];

    pub fn index(&self) -> usize {
        match self {
            Self::Add => 0,
            Self::Clr => 1,
            Self::Pls => 2,
            Self::Mod => 3,
            Self::Sys => 4,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Clr => "CLR",
            Self::Pls => "PLS",
            Self::Mod => "MOD",
            Self::Sys => "SYS",
        }
    }

    pub fn from_message_type(message_type: QoSMessageType) -> Self {
        match message_type {
            QoSMessageType::AddCacheLocation => Self::Add,
            QoSMessageType::ClearCacheLocation | QoSMessageType::CorruptFile => Self::Clr,
            QoSMessageType::PoolStatusDown | QoSMessageType::PoolStatusUp => Self::Pls,
            QoSMessageType::QosModified
            | QoSMessageType::QosModifiedCanceled
            | QoSMessageType::ValidateOnly => Self::Mod,
            QoSMessageType::SystemScan => Self::Sys,
        }
    }
}

#[derive(Debug, Default)]
struct QueueLists {
    ready: VecDeque<PnfsId>,
    running: VecDeque<PnfsId>,
    waiting: VecDeque<PnfsId>,
}

impl QueueLists {
    fn remove_from(deque: &mut VecDeque<PnfsId>, id: &PnfsId) -> bool {
        if let Some(pos) = deque.iter().position(|x| x == id) {
            deque.remove(pos);
            true
        } else {
            false
        }
    }
}

/// Counts snapshot used for info output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub ready: usize,
    pub running: usize,
    pub waiting: usize,
}

/// One scheduling queue with monitor-style signalling
///
/// The worker loop resets the signal counter, scans, and only waits when no
/// signal arrived during the scan; `notify` carries at most one stored
/// permit, which together with the counter closes the lost-wakeup window.
#[derive(Debug)]
pub struct VerifyOperationQueue {
    kind: QueueKind,
    max_running: usize,
    lists: Mutex<QueueLists>,
    signalled: AtomicUsize,
    notify: Notify,
}

fn lists_lock(lists: &Mutex<QueueLists>) -> std::sync::MutexGuard<'_, QueueLists> {
    lists.lock().unwrap_or_else(|e| e.into_inner())
}

impl VerifyOperationQueue {
    pub fn new(kind: QueueKind, max_running: usize) -> Self {
        Self {
            kind,
            max_running,
            lists: Mutex::new(QueueLists::default()),
            signalled: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Enqueue at the front of READY (retry priority)
    pub fn add_first(&self, id: PnfsId) {
        lists_lock(&self.lists).ready.push_front(id);
        self.signal();
    }

    /// Enqueue at the back of READY
    pub fn add_last(&self, id: PnfsId) {
        lists_lock(&self.lists).ready.push_back(id);
        self.signal();
    }

    /// Remove the id from whichever deque holds it
    pub fn remove(&self, id: &PnfsId) -> bool {
        let mut lists = lists_lock(&self.lists);
        QueueLists::remove_from(&mut lists.ready, id)
            || QueueLists::remove_from(&mut lists.running, id)
            || QueueLists::remove_from(&mut lists.waiting, id)
    }

    pub fn contains(&self, id: &PnfsId) -> bool {
        let lists = lists_lock(&self.lists);
        lists.ready.contains(id) || lists.running.contains(id) || lists.waiting.contains(id)
    }

    pub fn counts(&self) -> QueueCounts {
        let lists = lists_lock(&self.lists);
        QueueCounts {
            ready: lists.ready.len(),
            running: lists.running.len(),
            waiting: lists.waiting.len(),
        }
    }

    /// Admission control: pop READY ids into RUNNING up to the bound
    ///
    /// Returns the ids promoted by this call, in FIFO order.
    pub fn admit(&self) -> Vec<PnfsId> {
        let mut lists = lists_lock(&self.lists);
        let mut promoted = Vec::new();
        while lists.running.len() < self.max_running {
            match lists.ready.pop_front() {
                Some(id) => {
                    lists.running.push_back(id.clone());
                    promoted.push(id);
                }
                None => break,
            }
        }
        promoted
    }

    /// Park a RUNNING operation, freeing its slot
    pub fn to_waiting(&self, id: &PnfsId) -> bool {
        let mut lists = lists_lock(&self.lists);
        if QueueLists::remove_from(&mut lists.running, id) {
            lists.waiting.push_back(id.clone());
            true
        } else {
            false
        }
    }

    /// Sweep all three deques, removing ids the predicate marks as done
    ///
    /// The predicate sees ids whose operation has gone terminal (or has
    /// vanished from the map); removed ids are returned for hand-off to the
    /// post-processor.
    pub fn drain_terminated<F>(&self, mut is_done: F) -> Vec<PnfsId>
    where
        F: FnMut(&PnfsId) -> bool,
    {
        let mut lists = lists_lock(&self.lists);
        let lists = &mut *lists;
        let mut done = Vec::new();
        for deque in [&mut lists.ready, &mut lists.running, &mut lists.waiting] {
            let mut keep = VecDeque::with_capacity(deque.len());
            for id in deque.drain(..) {
                if is_done(&id) {
                    done.push(id);
                } else {
                    keep.push_back(id);
                }
            }
            *deque = keep;
        }
        done
    }

    pub fn signal(&self) {
        self.signalled.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Start of a scan pass; returns the signals consumed
    pub fn reset_signals(&self) -> usize {
        self.signalled.swap(0, Ordering::SeqCst)
    }

    pub fn signals(&self) -> usize {
        self.signalled.load(Ordering::SeqCst)
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// The fixed array of queues plus the rotating scan cursor
///
/// Each queue has its own worker, so cross-queue fairness reduces to the
/// order in which the manager's sweep signals them: every `signal_all`
/// starts one index past where the previous one started, visiting the
/// queues in cyclic order across sweeps.
#[derive(Debug)]
pub struct QueueIndex {
    queues: Vec<VerifyOperationQueue>,
    cursor: AtomicUsize,
}

impl QueueIndex {
    pub fn new(max_running: usize) -> Self {
        Self {
            queues: QueueKind::ALL
                .iter()
                .map(|k| VerifyOperationQueue::new(*k, max_running))
                .collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn queue(&self, kind: QueueKind) -> &VerifyOperationQueue {
        &self.queues[kind.index()]
    }

    pub fn queue_for(&self, message_type: QoSMessageType) -> &VerifyOperationQueue {
        self.queue(QueueKind::from_message_type(message_type))
    }

    /// The visit order for the next sweep: all indices, rotated
    pub fn scan_order(&self) -> Vec<usize> {
        let start = self.cursor.fetch_add(1, Ordering::SeqCst) % QUEUE_COUNT;
        (0..QUEUE_COUNT).map(|i| (start + i) % QUEUE_COUNT).collect()
    }

    pub fn signal_all(&self) {
        for i in self.scan_order() {
            self.queues[i].signal();
        }
    }

    pub fn counts(&self) -> Vec<(QueueKind, QueueCounts)> {
        self.queues.iter().map(|q| (q.kind(), q.counts())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> PnfsId {
        format!("0000{:04X}", n).as_str().into()
    }

    #[test]
    fn message_types_map_to_expected_queues() {
        assert_eq!(
            QueueKind::from_message_type(QoSMessageType::AddCacheLocation),
            QueueKind::Add
        );
        assert_eq!(
            QueueKind::from_message_type(QoSMessageType::ClearCacheLocation),
            QueueKind::Clr
        );
        assert_eq!(
            QueueKind::from_message_type(QoSMessageType::CorruptFile),
            QueueKind::Clr
        );
        assert_eq!(
            QueueKind::from_message_type(QoSMessageType::PoolStatusDown),
            QueueKind::Pls
        );
        assert_eq!(
            QueueKind::from_message_type(QoSMessageType::PoolStatusUp),
            QueueKind::Pls
        );
        assert_eq!(
            QueueKind::from_message_type(QoSMessageType::QosModified),
            QueueKind::Mod
        );
        assert_eq!(
            QueueKind::from_message_type(QoSMessageType::QosModifiedCanceled),
            QueueKind::Mod
        );
        assert_eq!(
            QueueKind::from_message_type(QoSMessageType::ValidateOnly),
            QueueKind::Mod
        );
        assert_eq!(
            QueueKind::from_message_type(QoSMessageType::SystemScan),
            QueueKind::Sys
        );
    }

    #[test]
    fn admit_is_fifo_and_bounded() {
        let q = VerifyOperationQueue::new(QueueKind::Add, 2);
        q.add_last(id(1));
        q.add_last(id(2));
        q.add_last(id(3));

        let promoted = q.admit();
        assert_eq!(promoted, vec![id(1), id(2)]);
        let counts = q.counts();
        assert_eq!(counts.running, 2);
        assert_eq!(counts.ready, 1);

        // at the bound, nothing further is admitted
        assert!(q.admit().is_empty());
    }

    #[test]
    fn add_first_takes_priority() {
        let q = VerifyOperationQueue::new(QueueKind::Add, 10);
        q.add_last(id(1));
        q.add_first(id(2));
        assert_eq!(q.admit(), vec![id(2), id(1)]);
    }

    #[test]
    fn to_waiting_frees_a_running_slot() {
        let q = VerifyOperationQueue::new(QueueKind::Sys, 1);
        q.add_last(id(1));
        q.add_last(id(2));
        assert_eq!(q.admit(), vec![id(1)]);
        assert!(q.admit().is_empty());

        assert!(q.to_waiting(&id(1)));
        let counts = q.counts();
        assert_eq!(counts.running, 0);
        assert_eq!(counts.waiting, 1);

        // the freed slot admits the next ready operation
        assert_eq!(q.admit(), vec![id(2)]);
    }

    #[test]
    fn drain_terminated_sweeps_all_deques() {
        let q = VerifyOperationQueue::new(QueueKind::Add, 1);
        q.add_last(id(1));
        q.add_last(id(2));
        q.admit();
        q.to_waiting(&id(1));
        q.admit();
        q.add_last(id(3));
        // now: waiting=[1] running=[2] ready=[3]

        let done = q.drain_terminated(|i| *i == id(1) || *i == id(3));
        assert_eq!(done.len(), 2);
        assert!(done.contains(&id(1)));
        assert!(done.contains(&id(3)));
        assert!(q.contains(&id(2)));
        assert!(!q.contains(&id(1)));
    }

    #[test]
    fn signals_accumulate_and_reset() {
        let q = VerifyOperationQueue::new(QueueKind::Add, 1);
        q.signal();
        q.signal();
        assert_eq!(q.signals(), 2);
        assert_eq!(q.reset_signals(), 2);
        assert_eq!(q.signals(), 0);
    }

    #[test]
    fn scan_order_is_cyclic() {
        let index = QueueIndex::new(10);
        let first = index.scan_order();
        let second = index.scan_order();
        let third = index.scan_order();
        assert_eq!(first, vec![0, 1, 2, 3, 4]);
        assert_eq!(second, vec![1, 2, 3, 4, 0]);
        assert_eq!(third, vec![2, 3, 4, 0, 1]);
        // every pass visits every queue exactly once
        for order in [&first, &second, &third] {
            let mut sorted = (*order).clone();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![0, 1, 2, 3, 4]);
        }
    }
}
