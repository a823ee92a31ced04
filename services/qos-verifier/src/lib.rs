// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! QoS Verifier Library
//!
//! This library provides the scheduling core of the QoS verification
//! service: the persistent operation manager with its per-message-type
//! queues and retry policy, the pool topology index, and the storage
//! backing for crash recovery. Verification engines plug in through the
//! [`handler::VerifyAndUpdateHandler`] trait.

pub mod config;
pub mod counters;
pub mod db;
pub mod filter;
pub mod handler;
pub mod history;
pub mod manager;
pub mod metrics;
pub mod operation;
pub mod pool_info;
pub mod queue;
pub mod scan_record;
pub mod topology;
pub mod types;

pub use manager::VerifyOperationManager;
pub use types::{FileQoSUpdate, PnfsId, QoSAction, QoSAdjustmentRequest, QoSMessageType};
