// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! The verification operation manager
//!
//! Owns the in-memory operation map (the single source of truth for
//! operation state), the per-message-type queues, the terminal
//! post-processor and the store reaper. One worker task services each
//! queue; the manager's own sweep task runs post-processing and batched
//! store deletion, then signals the queues in rotating order.
//!
//! Operations are keyed by pnfsid. Arrival is an idempotent upsert: a
//! second update for a file already under verification only refreshes its
//! storage unit. Completion always triggers a re-verification pass; an
//! operation leaves the map only through a voided pass, a cancellation or
//! an abort.

use chrono::Utc;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::config::VerifierConfig;
use crate::counters::QoSVerifierCounters;
use crate::db::{DbError, VerifyOperationDao};
use crate::filter::{VerifyOperationCancelFilter, VerifyOperationFilter};
use crate::handler::{AbortedOperation, CompletedOperation, VerifyAndUpdateHandler};
use crate::history::QoSHistory;
use crate::metrics;
use crate::operation::{FailureType, VerifyError, VerifyOperation};
use crate::pool_info::PoolInfoMap;
use crate::queue::{QueueIndex, QueueKind};
use crate::types::{FileQoSUpdate, PnfsId, QoSAction, QoSAdjustmentRequest, VerifyOperationState};

type OpRef = Arc<Mutex<VerifyOperation>>;

pub struct VerifyOperationManager {
    max_running: usize,
    max_retries: u32,
    sweep_interval: Duration,
    reload_grace: Duration,
    list_limit: usize,

    ops: RwLock<HashMap<PnfsId, OpRef>>,
    queues: QueueIndex,
    pool_info: Arc<PoolInfoMap>,
    dao: Arc<dyn VerifyOperationDao>,
    handler: Arc<dyn VerifyAndUpdateHandler>,
    counters: Arc<QoSVerifierCounters>,
    history: Arc<QoSHistory>,

    /// Terminal operations handed off by the queue workers
    post_queue: Mutex<Vec<PnfsId>>,
    /// Removed persistent operations awaiting batched store deletion
    reap_queue: Mutex<Vec<PnfsId>>,

    signalled: AtomicUsize,
    notify: Notify,
    shutdown_tx: watch::Sender<bool>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl VerifyOperationManager {
    pub fn new(
        config: &VerifierConfig,
        pool_info: Arc<PoolInfoMap>,
        dao: Arc<dyn VerifyOperationDao>,
        handler: Arc<dyn VerifyAndUpdateHandler>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            max_running: config.max_running,
            max_retries: config.max_retries,
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            reload_grace: Duration::from_secs(config.reload_grace_secs),
            list_limit: config.list_limit,
            ops: RwLock::new(HashMap::new()),
            queues: QueueIndex::new(config.max_running),
            pool_info,
            dao,
            handler,
            counters: Arc::new(QoSVerifierCounters::new()),
            history: Arc::new(QoSHistory::new(config.history_capacity)),
            post_queue: Mutex::new(Vec::new()),
            reap_queue: Mutex::new(Vec::new()),
            signalled: AtomicUsize::new(0),
            notify: Notify::new(),
            shutdown_tx,
        })
    }

    pub fn counters(&self) -> &QoSVerifierCounters {
        &self.counters
    }

    pub fn history(&self) -> &QoSHistory {
        &self.history
    }

    pub fn pool_info(&self) -> &PoolInfoMap {
        &self.pool_info
    }

    // -------------------------------------------------------------------
    // lifecycle
    // -------------------------------------------------------------------

    /// Reload persisted operations, then start the queue workers and the
    /// sweep task
    pub async fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        if !self.reload_grace.is_zero() {
            tracing::info!(
                grace_secs = self.reload_grace.as_secs(),
                "waiting before reloading persisted operations"
            );
            tokio::time::sleep(self.reload_grace).await;
        }
        self.reload().await;

        let mut handles = Vec::new();
        for kind in QueueKind::ALL {
            let manager = Arc::clone(&self);
            handles.push(tokio::spawn(manager.queue_worker(kind)));
        }
        handles.push(tokio::spawn(self.run()));
        handles
    }

    /// Wake every loop and let it exit; the sweep flushes the reaper on
    /// the way out
    ///
    /// `send_replace` records the flag even when no worker has subscribed
    /// yet, so a shutdown requested before `start` still takes effect.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.queues.signal_all();
        self.signal();
    }

    /// Populate the map and queues from the store after a restart
    ///
    /// The store demotes persisted RUNNING/WAITING rows to READY; whatever
    /// was in flight when the process died simply runs again.
    async fn reload(&self) {
        let loaded = match self.dao.load().await {
            Ok(ops) => ops,
            Err(e) => {
                metrics::record_db_operation_failure();
                tracing::error!(error = %e, "failed to reload persisted operations");
                return;
            }
        };
        let count = loaded.len();
        for op in loaded {
            let id = op.pnfs_id.clone();
            let message_type = op.message_type;
            {
                let mut ops = self.ops.write().unwrap_or_else(|e| e.into_inner());
                ops.insert(id.clone(), Arc::new(Mutex::new(op)));
            }
            self.queues.queue_for(message_type).add_last(id);
        }
        tracing::info!(count, "reloaded persisted operations");
    }

    // -------------------------------------------------------------------
    // arrival
    // -------------------------------------------------------------------

    /// Idempotent upsert for an incoming change notification
    ///
    /// Returns true when a new operation was registered. An update for a
    /// file already under verification only refreshes the storage unit;
    /// a pool-status arrival against an existing system-scan operation
    /// promotes the operation's message type, since pool status outranks
    /// the background scan.
    pub async fn create_or_update_operation(
        &self,
        update: FileQoSUpdate,
    ) -> Result<bool, DbError> {
        self.counters.increment_received(update.message_type);

        let existing = self.with_op(&update.pnfs_id, |op| {
            if update.storage_unit.is_some() {
                op.storage_unit = update.storage_unit.clone();
            }
            if matches!(
                update.message_type,
                crate::types::QoSMessageType::PoolStatusDown
                    | crate::types::QoSMessageType::PoolStatusUp
            ) && op.message_type == crate::types::QoSMessageType::SystemScan
            {
                op.message_type = update.message_type;
            }
        });
        if existing.is_some() {
            tracing::debug!(pnfsid = %update.pnfs_id, "operation already registered");
            return Ok(false);
        }

        let mut op = VerifyOperation::new(&update, Utc::now());
        op.make_ready();

        if update.message_type.is_persistent() {
            if let Err(e) = self.dao.store(&op).await {
                metrics::record_db_operation_failure();
                tracing::error!(pnfsid = %op.pnfs_id, error = %e, "failed to store operation");
                return Err(e);
            }
        }

        let id = op.pnfs_id.clone();
        let message_type = op.message_type;
        {
            let mut ops = self.ops.write().unwrap_or_else(|e| e.into_inner());
            if ops.contains_key(&id) {
                // lost a create race; the winner owns the operation
                return Ok(false);
            }
            ops.insert(id.clone(), Arc::new(Mutex::new(op)));
        }
        tracing::debug!(
            pnfsid = %id,
            message_type = %message_type,
            forced = update.forced,
            "registered operation"
        );
        self.queues.queue_for(message_type).add_last(id);
        Ok(true)
    }

    // -------------------------------------------------------------------
    // engine callbacks
    // -------------------------------------------------------------------

    /// Terminal result for the current pass; stale callbacks (e.g. after a
    /// cancel) are ignored
    pub fn update_operation(&self, pnfs_id: &PnfsId, error: Option<VerifyError>) -> bool {
        let now = Utc::now();
        let Some((changed, message_type)) = self.with_op(pnfs_id, |op| {
            let changed = op.update(error, now);
            (changed, op.message_type)
        }) else {
            return false;
        };
        if changed {
            self.queues.queue_for(message_type).signal();
        }
        changed
    }

    /// The engine decided on an adjustment; WAIT_FOR_STAGE parks the
    /// operation, freeing its running slot
    pub fn update_adjustment(&self, request: &QoSAdjustmentRequest) -> bool {
        let now = Utc::now();
        let Some((message_type, waiting)) = self.with_op(&request.pnfs_id, |op| {
            op.request_adjustment(request, now);
            (op.message_type, op.state == VerifyOperationState::Waiting)
        }) else {
            return false;
        };
        if waiting {
            let queue = self.queues.queue_for(message_type);
            queue.to_waiting(&request.pnfs_id);
            queue.signal();
        }
        true
    }

    /// The engine found nothing to adjust; the operation completes
    pub fn update_voided(&self, pnfs_id: &PnfsId) -> bool {
        let now = Utc::now();
        let Some(message_type) = self.with_op(pnfs_id, |op| {
            op.void(now);
            op.message_type
        }) else {
            return false;
        };
        self.queues.queue_for(message_type).signal();
        true
    }

    // -------------------------------------------------------------------
    // queue workers
    // -------------------------------------------------------------------

    async fn queue_worker(self: Arc<Self>, kind: QueueKind) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tracing::debug!(queue = kind.label(), "queue worker started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let queue = self.queues.queue(kind);
            queue.reset_signals();
            self.scan_queue(kind).await;
            if self.queues.queue(kind).signals() > 0 {
                continue;
            }
            let queue = self.queues.queue(kind);
            tokio::select! {
                _ = queue.notified() => {}
                _ = tokio::time::sleep(self.sweep_interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
        tracing::debug!(queue = kind.label(), "queue worker stopped");
    }

    /// One scan pass over a queue: hand terminal operations to the
    /// post-processor, then admit ready operations up to the running bound
    async fn scan_queue(&self, kind: QueueKind) {
        let queue = self.queues.queue(kind);

        let done = queue.drain_terminated(|id| {
            self.with_op(id, |op| op.is_in_terminal_state()).unwrap_or(true)
        });
        if !done.is_empty() {
            lock(&self.post_queue).extend(done);
            self.signal();
        }

        for id in queue.admit() {
            self.submit_to_run(id).await;
        }
    }

    async fn submit_to_run(&self, id: PnfsId) {
        let now = Utc::now();
        let submitted = self
            .with_op(&id, |op| {
                if op.state == VerifyOperationState::Ready {
                    op.submit(now);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if !submitted {
            // went terminal (or vanished) between admit and submit; the
            // next terminal drain collects it from the running deque
            return;
        }
        tracing::debug!(pnfsid = %id, "submitting verification");
        self.handler.handle_verification(id).await;
    }

    // -------------------------------------------------------------------
    // manager sweep
    // -------------------------------------------------------------------

    fn signal(&self) {
        self.signalled.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// The sweep loop: post-process, reap, signal queues in rotating
    /// order, then wait for a signal or the idle timeout
    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tracing::info!("operation manager sweep started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            self.signalled.store(0, Ordering::SeqCst);
            let started = Instant::now();

            self.process_post_queue().await;
            self.process_reaper(false).await;
            self.queues.signal_all();

            self.counters.record_sweep(Utc::now(), started.elapsed());

            if self.signalled.load(Ordering::SeqCst) > 0 {
                continue;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.sweep_interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
        // final drain so nothing terminal is stranded in the store
        self.process_post_queue().await;
        self.process_reaper(true).await;
        tracing::info!("operation manager sweep stopped");
    }

    async fn process_post_queue(&self) {
        let batch: Vec<PnfsId> = lock(&self.post_queue).drain(..).collect();
        for id in batch {
            self.post_process(&id).await;
        }
    }

    /// Batched store deletion; runs when enough removals are pending, or
    /// unconditionally on shutdown
    async fn process_reaper(&self, force: bool) {
        let ids: Vec<PnfsId> = {
            let mut pending = lock(&self.reap_queue);
            if pending.is_empty() || (!force && pending.len() < self.max_running) {
                return;
            }
            pending.drain(..).collect()
        };
        match self.dao.delete_batch(&ids).await {
            Ok(removed) => {
                tracing::debug!(removed, "reaped completed operations from store");
            }
            Err(e) => {
                metrics::record_db_operation_failure();
                tracing::error!(error = %e, "failed to reap operations; will retry");
                lock(&self.reap_queue).extend(ids);
            }
        }
    }

    // -------------------------------------------------------------------
    // post-processing
    // -------------------------------------------------------------------

    /// Decide the fate of a terminal operation: retry, abort or remove
    async fn post_process(&self, pnfs_id: &PnfsId) {
        let Some(op_ref) = self.get_ref(pnfs_id) else {
            return;
        };
        let snapshot = lock(&op_ref).clone();

        let mut retry = false;
        let mut abort = false;

        match snapshot.state {
            VerifyOperationState::Failed => {
                let failure = snapshot
                    .error
                    .as_ref()
                    .map_or(FailureType::Fatal, VerifyError::failure_type);
                match failure {
                    FailureType::NewSource => {
                        let mut op = lock(&op_ref);
                        if let Some(source) = op.source.clone() {
                            op.add_tried(&source);
                        }
                        op.reset_source_and_target();
                        retry = true;
                    }
                    FailureType::NewTarget => {
                        let mut op = lock(&op_ref);
                        if let Some(target) = op.target.clone() {
                            op.add_tried(&target);
                        }
                        op.reset_source_and_target();
                        retry = true;
                    }
                    FailureType::Retriable => {
                        if snapshot.retried < self.max_retries {
                            lock(&op_ref).increment_retried();
                            retry = true;
                        } else {
                            // the pair is exhausted; fall back to untried
                            // members of the pool group, if any
                            let tried = {
                                let mut op = lock(&op_ref);
                                if let Some(source) = op.source.clone() {
                                    op.add_tried(&source);
                                }
                                if let Some(target) = op.target.clone() {
                                    op.add_tried(&target);
                                }
                                op.tried.clone()
                            };
                            let group = snapshot.pool_group.clone().unwrap_or_else(|| {
                                self.pool_info.system_pool_group().to_string()
                            });
                            // readable members count: a read-only pool can
                            // still serve as the source of the next attempt
                            let members = self.pool_info.member_pools(&group, false);
                            if members.iter().any(|m| !tried.contains(m)) {
                                lock(&op_ref).reset_source_and_target();
                                retry = true;
                            } else {
                                abort = true;
                            }
                        }
                    }
                    FailureType::Fatal => {
                        let mut op = lock(&op_ref);
                        if let Some(source) = op.source.clone() {
                            op.add_tried(&source);
                        }
                        if let Some(target) = op.target.clone() {
                            op.add_tried(&target);
                        }
                        abort = true;
                    }
                }
            }
            VerifyOperationState::Done => {
                self.counters.increment_completed(
                    snapshot.source.as_deref(),
                    snapshot.target.as_deref(),
                    snapshot.completed_action(),
                );
                metrics::record_operation_completed();
            }
            VerifyOperationState::Canceled | VerifyOperationState::Aborted => {}
            _ => {
                // not terminal; a queue drained it spuriously
                return;
            }
        }

        if abort {
            let current = lock(&op_ref).clone();
            let pool = current.source.clone().or_else(|| current.parent.clone());
            tracing::warn!(
                pnfsid = %current.pnfs_id,
                pool = pool.as_deref().unwrap_or("-"),
                retried = current.retried,
                error = current
                    .error
                    .as_ref()
                    .map_or_else(|| "-".to_string(), |e| e.to_string()),
                "aborting verification operation"
            );
            self.handler
                .operation_aborted(AbortedOperation {
                    pnfs_id: current.pnfs_id.clone(),
                    pool: pool.clone(),
                    tried: current.tried.clone(),
                    retried: current.retried,
                    max_retries: self.max_retries,
                    error: current.error.clone(),
                })
                .await;
            self.counters.increment_failed(pool.as_deref());
            metrics::record_operation_aborted();
            lock(&op_ref).abort(Utc::now());
        }

        let action = lock(&op_ref).action;
        if abort || (!retry && action == Some(QoSAction::Void)) {
            self.remove_operation(&op_ref, abort).await;
        } else if retry {
            self.reset_operation(&op_ref, true);
        } else {
            // DONE with a real action (re-verify), or a kept cancel
            self.reset_operation(&op_ref, false);
        }
    }

    /// Requeue for another pass
    ///
    /// Retried and under-replicated operations (fewer than two adjustments
    /// outstanding) go to the front, mirroring the `last_update` rewind in
    /// `VerifyOperation::reset`; multi-pass operations rejoin at the back.
    fn reset_operation(&self, op_ref: &OpRef, retry: bool) {
        let now = Utc::now();
        let (id, message_type, front) = {
            let mut op = lock(op_ref);
            op.reset(retry, now);
            (op.pnfs_id.clone(), op.message_type, retry || op.needed < 2)
        };
        let queue = self.queues.queue_for(message_type);
        if front {
            queue.add_first(id);
        } else {
            queue.add_last(id);
        }
    }

    /// Drop a finished operation: scan-record bookkeeping, history, map
    /// removal, reaper hand-off and the completion notification
    async fn remove_operation(&self, op_ref: &OpRef, aborted: bool) {
        let snapshot = lock(op_ref).clone();

        if let Some(parent) = &snapshot.parent {
            self.handler.update_scan_record(parent, aborted).await;
        }

        self.history
            .add(snapshot.pnfs_id.clone(), snapshot.summary(), aborted);

        {
            let mut ops = self.ops.write().unwrap_or_else(|e| e.into_inner());
            ops.remove(&snapshot.pnfs_id);
        }

        if snapshot.message_type.is_persistent() {
            lock(&self.reap_queue).push(snapshot.pnfs_id.clone());
            self.signal();
        }

        self.handler
            .action_completed(CompletedOperation {
                pnfs_id: snapshot.pnfs_id.clone(),
                state: snapshot.state,
                action: snapshot.completed_action(),
                parent: snapshot.parent.clone(),
                error: snapshot.error.clone(),
            })
            .await;

        tracing::debug!(
            pnfsid = %snapshot.pnfs_id,
            state = %snapshot.state,
            "operation removed"
        );
    }

    // -------------------------------------------------------------------
    // cancellation
    // -------------------------------------------------------------------

    /// Cancel every live operation the filter matches
    ///
    /// Canceled operations without forced removal are requeued for a later
    /// pass by post-processing; forced removal voids the action, removes
    /// them and deletes their rows. Empty filters are rejected: they would
    /// cancel everything.
    pub async fn cancel(&self, cancel: &VerifyOperationCancelFilter) -> Result<u64, DbError> {
        if cancel.filter.is_empty() {
            tracing::warn!("refusing cancellation with an empty filter");
            return Ok(0);
        }
        let now = Utc::now();
        let mut count = 0u64;
        {
            let ops = self.ops.read().unwrap_or_else(|e| e.into_inner());
            for op_ref in ops.values() {
                let mut op = lock(op_ref);
                if !op.is_in_terminal_state() && cancel.filter.matches(&op) {
                    op.cancel(cancel.should_remove, now);
                    count += 1;
                }
            }
        }
        self.queues.signal_all();
        self.signal();

        if cancel.should_remove {
            if let Err(e) = self.dao.delete(&cancel.filter).await {
                metrics::record_db_operation_failure();
                tracing::error!(error = %e, "failed to delete canceled operations");
                return Err(e);
            }
        }
        tracing::info!(count, remove = cancel.should_remove, "canceled operations");
        Ok(count)
    }

    /// Pool-scoped cancellation; `only_parent` restricts it to scans of
    /// the pool
    pub async fn cancel_file_ops_for_pool(
        &self,
        pool: &str,
        only_parent: bool,
        should_remove: bool,
    ) -> Result<u64, DbError> {
        let filter = VerifyOperationCancelFilter::for_pool(pool, only_parent, should_remove);
        self.cancel(&filter).await
    }

    // -------------------------------------------------------------------
    // inspection
    // -------------------------------------------------------------------

    pub fn size(&self) -> usize {
        self.ops.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn get_operation(&self, pnfs_id: &PnfsId) -> Option<VerifyOperation> {
        self.with_op(pnfs_id, |op| op.clone())
    }

    pub fn count_matching(&self, filter: &VerifyOperationFilter) -> usize {
        let ops = self.ops.read().unwrap_or_else(|e| e.into_inner());
        ops.values().filter(|op_ref| filter.matches(&lock(op_ref))).count()
    }

    /// Matching operation summaries in fairness order, capped at the
    /// configured listing limit
    pub fn list(&self, filter: &VerifyOperationFilter) -> Vec<String> {
        let mut matched: Vec<VerifyOperation> = {
            let ops = self.ops.read().unwrap_or_else(|e| e.into_inner());
            ops.values()
                .filter_map(|op_ref| {
                    let op = lock(op_ref);
                    filter.matches(&op).then(|| op.clone())
                })
                .collect()
        };
        matched.sort_by(|a, b| {
            a.last_update
                .cmp(&b.last_update)
                .then(a.arrived.cmp(&b.arrived))
        });
        matched
            .iter()
            .take(self.list_limit)
            .map(VerifyOperation::summary)
            .collect()
    }

    /// Counts by state, by message type and per queue, plus the counters
    pub fn info(&self) -> String {
        let mut by_state: HashMap<VerifyOperationState, usize> = HashMap::new();
        let mut by_type: HashMap<crate::types::QoSMessageType, usize> = HashMap::new();
        {
            let ops = self.ops.read().unwrap_or_else(|e| e.into_inner());
            for op_ref in ops.values() {
                let op = lock(op_ref);
                *by_state.entry(op.state).or_insert(0) += 1;
                *by_type.entry(op.message_type).or_insert(0) += 1;
            }
        }

        let mut out = String::new();
        let _ = writeln!(out, "operations {}", self.size());
        let mut states: Vec<_> = by_state.into_iter().collect();
        states.sort_by_key(|(s, _)| s.to_string());
        for (state, count) in states {
            let _ = writeln!(out, "state {:<16} {}", state.to_string(), count);
        }
        let mut types: Vec<_> = by_type.into_iter().collect();
        types.sort_by_key(|(t, _)| t.to_string());
        for (message_type, count) in types {
            let _ = writeln!(out, "type  {:<24} {}", message_type.to_string(), count);
        }
        for (kind, counts) in self.queues.counts() {
            let _ = writeln!(
                out,
                "queue {} ready {} running {} waiting {}",
                kind.label(),
                counts.ready,
                counts.running,
                counts.waiting
            );
        }
        out.push_str(&self.counters.report());
        out
    }

    // -------------------------------------------------------------------
    // internals
    // -------------------------------------------------------------------

    fn get_ref(&self, pnfs_id: &PnfsId) -> Option<OpRef> {
        self.ops
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(pnfs_id)
            .cloned()
    }

    fn with_op<T>(&self, pnfs_id: &PnfsId, f: impl FnOnce(&mut VerifyOperation) -> T) -> Option<T> {
        let op_ref = self.get_ref(pnfs_id)?;
        let mut op = lock(&op_ref);
        Some(f(&mut op))
    }
}
