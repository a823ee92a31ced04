// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! The per-file verification operation and its state machine
//!
//! A `VerifyOperation` tracks a single file through repeated
//! verify-adjust-reverify passes until the verification engine reports that
//! nothing more is needed (a voided pass), the operation is canceled, or the
//! retry policy gives up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::types::{
    FileQoSUpdate, PnfsId, QoSAction, QoSAdjustmentRequest, QoSMessageType, VerifyOperationState,
};

/// Failure of a verification pass or of the adjustment it launched
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum VerifyError {
    #[error("source replica unreadable on {0}")]
    SourceUnreadable(String),

    #[error("source replica broken on {0}")]
    BrokenSource(String),

    #[error("target pool rejected write: {0}")]
    TargetUnwritable(String),

    #[error("no space on target {0}")]
    NoSpaceOnTarget(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("replica locked: {0}")]
    LockedReplica(String),

    #[error("file no longer exists: {0}")]
    FileNotFound(String),

    #[error("file inaccessible: {0}")]
    Inaccessible(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// What post-processing should do about a FAILED operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// The source replica is at fault; retry against a new source
    NewSource,
    /// The target pool is at fault; retry against a new target
    NewTarget,
    /// Transient; retry the same pair up to the retry bound
    Retriable,
    /// Unrecoverable; abort and remove
    Fatal,
}

impl VerifyError {
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::SourceUnreadable(_) | Self::BrokenSource(_) => FailureType::NewSource,
            Self::TargetUnwritable(_) | Self::NoSpaceOnTarget(_) => FailureType::NewTarget,
            Self::Timeout(_) | Self::ServiceUnavailable(_) | Self::LockedReplica(_) => {
                FailureType::Retriable
            }
            Self::FileNotFound(_) | Self::Inaccessible(_) | Self::Internal(_) => FailureType::Fatal,
        }
    }
}

/// State of a single file's verification, keyed by pnfsid
///
/// Fairness ordering across operations is by `(last_update, arrived)`; a
/// reset only rewinds `last_update` to `arrived` when the operation is being
/// retried or has at most one adjustment outstanding, so multi-pass
/// operations do not monopolize their queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOperation {
    pub pnfs_id: PnfsId,
    pub arrived: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub message_type: QoSMessageType,
    pub storage_unit: Option<String>,
    pub pool_group: Option<String>,
    /// Pool whose scan produced this operation, if any
    pub parent: Option<String>,
    pub source: Option<String>,
    pub target: Option<String>,
    pub retried: u32,
    /// Watermark of the engine's adjustment estimates; never decreases
    pub needed: u32,
    pub state: VerifyOperationState,
    pub action: Option<QoSAction>,
    pub previous_action: Option<QoSAction>,
    /// Pools already tried and found wanting for this file
    pub tried: HashSet<String>,
    pub error: Option<VerifyError>,
}

impl VerifyOperation {
    pub fn new(update: &FileQoSUpdate, now: DateTime<Utc>) -> Self {
        let parent = update.parent().map(str::to_string);
        let source = if parent.is_none() {
            update.pool.clone()
        } else {
            None
        };
        Self {
            pnfs_id: update.pnfs_id.clone(),
            arrived: now,
            last_update: now,
            message_type: update.message_type,
            storage_unit: update.storage_unit.clone(),
            pool_group: None,
            parent,
            source,
            target: None,
            retried: 0,
            needed: 0,
            state: VerifyOperationState::Uninitialized,
            action: None,
            previous_action: None,
            tried: HashSet::new(),
            error: None,
        }
    }

    pub fn is_in_terminal_state(&self) -> bool {
        self.state.is_terminal()
    }

    /// Enqueue-time transition out of UNINITIALIZED
    pub fn make_ready(&mut self) {
        self.state = VerifyOperationState::Ready;
    }

    /// Admission transition; the operation has been handed to the engine
    pub fn submit(&mut self, now: DateTime<Utc>) {
        self.state = VerifyOperationState::Running;
        self.last_update = now;
    }

    /// Terminal result callback from the engine
    ///
    /// Only meaningful while RUNNING or WAITING; returns false (and changes
    /// nothing) otherwise, so stale callbacks after a cancel are ignored.
    pub fn update(&mut self, error: Option<VerifyError>, now: DateTime<Utc>) -> bool {
        match self.state {
            VerifyOperationState::Running | VerifyOperationState::Waiting => {
                self.state = if error.is_some() {
                    VerifyOperationState::Failed
                } else {
                    VerifyOperationState::Done
                };
                self.error = error;
                self.last_update = now;
                true
            }
            _ => false,
        }
    }

    /// Record the engine's adjustment decision
    pub fn request_adjustment(&mut self, request: &QoSAdjustmentRequest, now: DateTime<Utc>) {
        self.action = Some(request.action);
        self.source = request.source.clone();
        self.target = request.target.clone();
        if request.pool_group.is_some() {
            self.pool_group = request.pool_group.clone();
        }
        self.needed = self.needed.max(request.needed);
        self.last_update = now;
        if request.action == QoSAction::WaitForStage {
            self.state = VerifyOperationState::Waiting;
        }
    }

    /// The engine found nothing to adjust; this pass completes the operation
    pub fn void(&mut self, now: DateTime<Utc>) {
        self.previous_action = self.action;
        self.action = Some(QoSAction::Void);
        self.state = VerifyOperationState::Done;
        self.error = None;
        self.last_update = now;
    }

    pub fn abort(&mut self, now: DateTime<Utc>) {
        self.state = VerifyOperationState::Aborted;
        self.last_update = now;
    }

    /// Cancel; a forced removal also voids the action
    pub fn cancel(&mut self, remove: bool, now: DateTime<Utc>) {
        self.state = VerifyOperationState::Canceled;
        if remove {
            self.action = Some(QoSAction::Void);
        }
        self.last_update = now;
    }

    /// Return to READY for another pass
    ///
    /// `last_update` rewinds to `arrived` only for retries and for
    /// operations with fewer than two adjustments outstanding; otherwise the
    /// operation keeps its later timestamp and yields to peers.
    pub fn reset(&mut self, retry: bool, now: DateTime<Utc>) {
        self.state = VerifyOperationState::Ready;
        self.error = None;
        self.last_update = if retry || self.needed < 2 {
            self.arrived
        } else {
            now
        };
    }

    pub fn increment_retried(&mut self) {
        self.retried += 1;
    }

    /// Forget the current source/target pair and its retry count
    pub fn reset_source_and_target(&mut self) {
        self.source = None;
        self.target = None;
        self.retried = 0;
    }

    pub fn add_tried(&mut self, pool: &str) {
        self.tried.insert(pool.to_string());
    }

    /// The action to report for a completed operation
    ///
    /// A voided final pass reports the action of the pass before it, which
    /// is what actually changed the file.
    pub fn completed_action(&self) -> Option<QoSAction> {
        match self.action {
            Some(QoSAction::Void) => self.previous_action.or(self.action),
            other => other,
        }
    }

    /// One-line rendering for history and listings
    pub fn summary(&self) -> String {
        format!(
            "{} ({}) state {} action {} source {} target {} retried {} error {}",
            self.pnfs_id,
            self.message_type,
            self.state,
            self.action.map_or_else(|| "-".to_string(), |a| a.to_string()),
            self.source.as_deref().unwrap_or("-"),
            self.target.as_deref().unwrap_or("-"),
            self.retried,
            self.error
                .as_ref()
                .map_or_else(|| "-".to_string(), |e| e.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn op(message_type: QoSMessageType) -> VerifyOperation {
        let update = FileQoSUpdate::new("0000ABCD".into(), message_type).with_pool("pool-1");
        VerifyOperation::new(&update, Utc::now())
    }

    fn request(action: QoSAction, needed: u32) -> QoSAdjustmentRequest {
        QoSAdjustmentRequest {
            pnfs_id: "0000ABCD".into(),
            action,
            source: Some("pool-1".to_string()),
            target: Some("pool-2".to_string()),
            pool_group: Some("group-a".to_string()),
            needed,
        }
    }

    #[test]
    fn new_operation_starts_uninitialized() {
        let op = op(QoSMessageType::AddCacheLocation);
        assert_eq!(op.state, VerifyOperationState::Uninitialized);
        assert_eq!(op.arrived, op.last_update);
        assert_eq!(op.source.as_deref(), Some("pool-1"));
        assert!(op.parent.is_none());
    }

    #[test]
    fn scan_update_sets_parent_not_source() {
        let op = op(QoSMessageType::PoolStatusDown);
        assert_eq!(op.parent.as_deref(), Some("pool-1"));
        assert!(op.source.is_none());
    }

    #[test]
    fn update_while_running_goes_terminal() {
        let mut op = op(QoSMessageType::AddCacheLocation);
        op.make_ready();
        op.submit(Utc::now());
        assert!(op.update(None, Utc::now()));
        assert_eq!(op.state, VerifyOperationState::Done);
    }

    #[test]
    fn update_with_error_fails() {
        let mut op = op(QoSMessageType::AddCacheLocation);
        op.make_ready();
        op.submit(Utc::now());
        let err = VerifyError::Timeout("mover".to_string());
        assert!(op.update(Some(err.clone()), Utc::now()));
        assert_eq!(op.state, VerifyOperationState::Failed);
        assert_eq!(op.error, Some(err));
    }

    #[test]
    fn stale_update_after_cancel_is_ignored() {
        let mut op = op(QoSMessageType::AddCacheLocation);
        op.make_ready();
        op.submit(Utc::now());
        op.cancel(false, Utc::now());
        assert!(!op.update(None, Utc::now()));
        assert_eq!(op.state, VerifyOperationState::Canceled);
    }

    #[test]
    fn wait_for_stage_parks_the_operation() {
        let mut op = op(QoSMessageType::SystemScan);
        op.make_ready();
        op.submit(Utc::now());
        op.request_adjustment(&request(QoSAction::WaitForStage, 1), Utc::now());
        assert_eq!(op.state, VerifyOperationState::Waiting);
        // terminal callback is still honored from WAITING
        assert!(op.update(None, Utc::now()));
    }

    #[test]
    fn needed_watermark_never_decreases() {
        let mut op = op(QoSMessageType::QosModified);
        op.make_ready();
        op.submit(Utc::now());
        op.request_adjustment(&request(QoSAction::CopyReplica, 3), Utc::now());
        assert_eq!(op.needed, 3);
        op.request_adjustment(&request(QoSAction::CopyReplica, 1), Utc::now());
        assert_eq!(op.needed, 3);
        op.request_adjustment(&request(QoSAction::CopyReplica, 5), Utc::now());
        assert_eq!(op.needed, 5);
    }

    #[test]
    fn reset_rewinds_last_update_for_retry() {
        let mut op = op(QoSMessageType::AddCacheLocation);
        op.make_ready();
        let later = op.arrived + Duration::seconds(60);
        op.submit(later);
        op.needed = 5;
        op.reset(true, later);
        assert_eq!(op.last_update, op.arrived);
    }

    #[test]
    fn reset_rewinds_last_update_for_single_adjustment() {
        let mut op = op(QoSMessageType::AddCacheLocation);
        op.make_ready();
        let later = op.arrived + Duration::seconds(60);
        op.submit(later);
        op.needed = 1;
        op.reset(false, later);
        assert_eq!(op.last_update, op.arrived);
    }

    #[test]
    fn reset_keeps_later_timestamp_for_multi_adjustment() {
        let mut op = op(QoSMessageType::AddCacheLocation);
        op.make_ready();
        let later = op.arrived + Duration::seconds(60);
        op.submit(later);
        op.needed = 2;
        op.reset(false, later);
        assert_eq!(op.last_update, later);
        assert!(op.last_update > op.arrived);
    }

    #[test]
    fn voided_pass_reports_previous_action() {
        let mut op = op(QoSMessageType::QosModified);
        op.make_ready();
        op.submit(Utc::now());
        op.request_adjustment(&request(QoSAction::CopyReplica, 1), Utc::now());
        op.update(None, Utc::now());
        op.reset(false, Utc::now());
        op.submit(Utc::now());
        op.void(Utc::now());
        assert_eq!(op.action, Some(QoSAction::Void));
        assert_eq!(op.completed_action(), Some(QoSAction::CopyReplica));
    }

    #[test]
    fn forced_cancel_voids_action() {
        let mut op = op(QoSMessageType::AddCacheLocation);
        op.make_ready();
        op.submit(Utc::now());
        op.request_adjustment(&request(QoSAction::CopyReplica, 1), Utc::now());
        op.cancel(true, Utc::now());
        assert_eq!(op.state, VerifyOperationState::Canceled);
        assert_eq!(op.action, Some(QoSAction::Void));
    }

    #[test]
    fn reset_source_and_target_clears_retry_count() {
        let mut op = op(QoSMessageType::AddCacheLocation);
        op.target = Some("pool-2".to_string());
        op.retried = 3;
        op.reset_source_and_target();
        assert!(op.source.is_none());
        assert!(op.target.is_none());
        assert_eq!(op.retried, 0);
    }

    // -------------------------------------------------------------------------
    // Failure classification
    // -------------------------------------------------------------------------

    #[test]
    fn classification_covers_all_kinds() {
        assert_eq!(
            VerifyError::SourceUnreadable("p".into()).failure_type(),
            FailureType::NewSource
        );
        assert_eq!(
            VerifyError::BrokenSource("p".into()).failure_type(),
            FailureType::NewSource
        );
        assert_eq!(
            VerifyError::TargetUnwritable("p".into()).failure_type(),
            FailureType::NewTarget
        );
        assert_eq!(
            VerifyError::NoSpaceOnTarget("p".into()).failure_type(),
            FailureType::NewTarget
        );
        assert_eq!(
            VerifyError::Timeout("t".into()).failure_type(),
            FailureType::Retriable
        );
        assert_eq!(
            VerifyError::ServiceUnavailable("s".into()).failure_type(),
            FailureType::Retriable
        );
        assert_eq!(
            VerifyError::LockedReplica("l".into()).failure_type(),
            FailureType::Retriable
        );
        assert_eq!(
            VerifyError::FileNotFound("f".into()).failure_type(),
            FailureType::Fatal
        );
        assert_eq!(
            VerifyError::Inaccessible("i".into()).failure_type(),
            FailureType::Fatal
        );
        assert_eq!(
            VerifyError::Internal("x".into()).failure_type(),
            FailureType::Fatal
        );
    }
}
