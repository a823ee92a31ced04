// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Shared types for verification operation tracking

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Namespace identifier of a file under verification
///
/// Opaque to the scheduler; used as the key of the operation map and the
/// primary key of the persistent store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PnfsId(String);

impl PnfsId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PnfsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PnfsId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty pnfsid".to_string());
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for PnfsId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The event kinds that can trigger a verification
///
/// Each type maps to exactly one scheduling queue. Pool status and system
/// scan operations are memory-only; all other types are durably stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoSMessageType {
    AddCacheLocation,
    ClearCacheLocation,
    CorruptFile,
    PoolStatusDown,
    PoolStatusUp,
    QosModified,
    QosModifiedCanceled,
    ValidateOnly,
    SystemScan,
}

impl QoSMessageType {
    /// Whether operations of this type survive a restart
    pub fn is_persistent(&self) -> bool {
        !matches!(
            self,
            Self::PoolStatusDown | Self::PoolStatusUp | Self::SystemScan
        )
    }

    /// Whether this type originates from a pool-wide scan
    pub fn is_scan(&self) -> bool {
        matches!(
            self,
            Self::PoolStatusDown | Self::PoolStatusUp | Self::SystemScan
        )
    }
}

impl fmt::Display for QoSMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddCacheLocation => write!(f, "add_cache_location"),
            Self::ClearCacheLocation => write!(f, "clear_cache_location"),
            Self::CorruptFile => write!(f, "corrupt_file"),
            Self::PoolStatusDown => write!(f, "pool_status_down"),
            Self::PoolStatusUp => write!(f, "pool_status_up"),
            Self::QosModified => write!(f, "qos_modified"),
            Self::QosModifiedCanceled => write!(f, "qos_modified_canceled"),
            Self::ValidateOnly => write!(f, "validate_only"),
            Self::SystemScan => write!(f, "system_scan"),
        }
    }
}

impl FromStr for QoSMessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add_cache_location" => Ok(Self::AddCacheLocation),
            "clear_cache_location" => Ok(Self::ClearCacheLocation),
            "corrupt_file" => Ok(Self::CorruptFile),
            "pool_status_down" => Ok(Self::PoolStatusDown),
            "pool_status_up" => Ok(Self::PoolStatusUp),
            "qos_modified" => Ok(Self::QosModified),
            "qos_modified_canceled" => Ok(Self::QosModifiedCanceled),
            "validate_only" => Ok(Self::ValidateOnly),
            "system_scan" => Ok(Self::SystemScan),
            _ => Err(format!("Unknown message type: {}", s)),
        }
    }
}

/// The adjustment the verification engine decided on for an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoSAction {
    /// Nothing to do; the operation is satisfied
    Void,
    /// A staging request is in flight; the operation parks in WAITING
    WaitForStage,
    CacheReplica,
    PersistReplica,
    UnsetPreciousReplica,
    CopyReplica,
    Flush,
    NotifyMissing,
    NotifyInaccessible,
    NotifyOutOfSync,
    PoolSelectionFailure,
}

impl fmt::Display for QoSAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => write!(f, "void"),
            Self::WaitForStage => write!(f, "wait_for_stage"),
            Self::CacheReplica => write!(f, "cache_replica"),
            Self::PersistReplica => write!(f, "persist_replica"),
            Self::UnsetPreciousReplica => write!(f, "unset_precious_replica"),
            Self::CopyReplica => write!(f, "copy_replica"),
            Self::Flush => write!(f, "flush"),
            Self::NotifyMissing => write!(f, "notify_missing"),
            Self::NotifyInaccessible => write!(f, "notify_inaccessible"),
            Self::NotifyOutOfSync => write!(f, "notify_out_of_sync"),
            Self::PoolSelectionFailure => write!(f, "pool_selection_failure"),
        }
    }
}

impl FromStr for QoSAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "void" => Ok(Self::Void),
            "wait_for_stage" => Ok(Self::WaitForStage),
            "cache_replica" => Ok(Self::CacheReplica),
            "persist_replica" => Ok(Self::PersistReplica),
            "unset_precious_replica" => Ok(Self::UnsetPreciousReplica),
            "copy_replica" => Ok(Self::CopyReplica),
            "flush" => Ok(Self::Flush),
            "notify_missing" => Ok(Self::NotifyMissing),
            "notify_inaccessible" => Ok(Self::NotifyInaccessible),
            "notify_out_of_sync" => Ok(Self::NotifyOutOfSync),
            "pool_selection_failure" => Ok(Self::PoolSelectionFailure),
            _ => Err(format!("Unknown action: {}", s)),
        }
    }
}

/// Lifecycle state of a verification operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyOperationState {
    /// Constructed but not yet enqueued
    Uninitialized,
    /// Eligible to run, waiting for an admission slot
    Ready,
    /// Submitted to the verification engine
    Running,
    /// Parked pending an external stage request
    Waiting,
    /// Last adjustment completed successfully
    Done,
    /// Canceled by an operator or a pool-scoped cancellation
    Canceled,
    /// Last adjustment failed; awaiting post-processing
    Failed,
    /// Given up after exhausting the retry policy
    Aborted,
}

impl VerifyOperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Canceled | Self::Failed | Self::Aborted
        )
    }
}

impl fmt::Display for VerifyOperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Waiting => write!(f, "waiting"),
            Self::Done => write!(f, "done"),
            Self::Canceled => write!(f, "canceled"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

impl FromStr for VerifyOperationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninitialized" => Ok(Self::Uninitialized),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "done" => Ok(Self::Done),
            "canceled" => Ok(Self::Canceled),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            _ => Err(format!("Unknown state: {}", s)),
        }
    }
}

/// An incoming change notification for a single file
///
/// This is the input to `create_or_update_operation`. For scan-originated
/// types the pool is the parent of the operation; otherwise it is a
/// location hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileQoSUpdate {
    pub pnfs_id: PnfsId,
    pub message_type: QoSMessageType,
    pub pool: Option<String>,
    pub storage_unit: Option<String>,
    /// Admin- or scanner-forced verification; the engine skips its
    /// has-anything-changed precheck for forced updates
    #[serde(default)]
    pub forced: bool,
}

impl FileQoSUpdate {
    pub fn new(pnfs_id: PnfsId, message_type: QoSMessageType) -> Self {
        Self {
            pnfs_id,
            message_type,
            pool: None,
            storage_unit: None,
            forced: false,
        }
    }

    pub fn with_pool(mut self, pool: &str) -> Self {
        self.pool = Some(pool.to_string());
        self
    }

    pub fn with_storage_unit(mut self, unit: &str) -> Self {
        self.storage_unit = Some(unit.to_string());
        self
    }

    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }

    /// The parent pool, when this update came from a pool-wide scan
    pub fn parent(&self) -> Option<&str> {
        if self.message_type.is_scan() {
            self.pool.as_deref()
        } else {
            None
        }
    }
}

/// The verification engine's decision for an operation
///
/// `needed` is the engine's estimate of how many adjustments remain for the
/// file, including this one. The operation keeps the running maximum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QoSAdjustmentRequest {
    pub pnfs_id: PnfsId,
    pub action: QoSAction,
    pub source: Option<String>,
    pub target: Option<String>,
    pub pool_group: Option<String>,
    pub needed: u32,
}

/// Replication constraints attached to a storage unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUnitConstraints {
    /// Required replica count, if the unit overrides the default
    pub required: Option<u16>,
    /// Pool tag names across which replicas must not collide
    pub one_copy_per: HashSet<String>,
}

impl StorageUnitConstraints {
    pub fn new(required: Option<u16>, one_copy_per: HashSet<String>) -> Self {
        Self {
            required,
            one_copy_per,
        }
    }

    pub fn has_requirement(&self) -> bool {
        self.required.is_some()
    }
}
