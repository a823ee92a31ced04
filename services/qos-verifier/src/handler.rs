// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Seam to the verification engine
//!
//! The scheduler never inspects replicas itself. When it promotes an
//! operation to RUNNING it hands the pnfsid to the engine through this
//! trait; the engine later calls back into the manager with a terminal
//! result, an adjustment request, or a void. The notification methods flow
//! the other way: the scheduler reporting outcomes to the engine's
//! bookkeeping.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::operation::VerifyError;
use crate::types::{PnfsId, QoSAction, VerifyOperationState};

/// Outcome payload for `action_completed`
#[derive(Debug, Clone)]
pub struct CompletedOperation {
    pub pnfs_id: PnfsId,
    pub state: VerifyOperationState,
    /// The action that actually changed the file; a voided final pass
    /// reports the action of the pass before it
    pub action: Option<QoSAction>,
    pub parent: Option<String>,
    pub error: Option<VerifyError>,
}

/// Payload for the fatal-failure notification
#[derive(Debug, Clone)]
pub struct AbortedOperation {
    pub pnfs_id: PnfsId,
    pub pool: Option<String>,
    pub tried: HashSet<String>,
    pub retried: u32,
    pub max_retries: u32,
    pub error: Option<VerifyError>,
}

#[async_trait]
pub trait VerifyAndUpdateHandler: Send + Sync {
    /// Run a verification pass for the file; the engine reports back via
    /// the manager's update entry points
    ///
    /// Called from the queue workers, so implementations must return
    /// promptly and spawn any long-running verification work themselves.
    async fn handle_verification(&self, pnfs_id: PnfsId);

    /// An operation exhausted its retry policy and was aborted
    async fn operation_aborted(&self, aborted: AbortedOperation);

    /// A scan-originated operation finished; update the parent's record
    async fn update_scan_record(&self, parent: &str, failed: bool);

    /// Terminal outcome notification for any completed operation
    async fn action_completed(&self, completed: CompletedOperation);
}

#[cfg(test)]
pub mod stub {
    //! Recording handler used by the manager unit tests

    use super::*;
    use std::sync::Mutex;

    /// Records every callback; never initiates verification on its own
    #[derive(Default)]
    pub struct RecordingHandler {
        pub verifications: Mutex<Vec<PnfsId>>,
        pub aborted: Mutex<Vec<AbortedOperation>>,
        pub scan_updates: Mutex<Vec<(String, bool)>>,
        pub completed: Mutex<Vec<CompletedOperation>>,
    }

    impl RecordingHandler {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn verification_count(&self) -> usize {
            #[allow(clippy::unwrap_used)]
            self.verifications.lock().unwrap().len()
        }

        pub fn completed_count(&self) -> usize {
            #[allow(clippy::unwrap_used)]
            self.completed.lock().unwrap().len()
        }

        pub fn aborted_count(&self) -> usize {
            #[allow(clippy::unwrap_used)]
            self.aborted.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl VerifyAndUpdateHandler for RecordingHandler {
        async fn handle_verification(&self, pnfs_id: PnfsId) {
            #[allow(clippy::unwrap_used)]
            self.verifications.lock().unwrap().push(pnfs_id);
        }

        async fn operation_aborted(&self, aborted: AbortedOperation) {
            #[allow(clippy::unwrap_used)]
            self.aborted.lock().unwrap().push(aborted);
        }

        async fn update_scan_record(&self, parent: &str, failed: bool) {
            #[allow(clippy::unwrap_used)]
            self.scan_updates
                .lock()
                .unwrap()
                .push((parent.to_string(), failed));
        }

        async fn action_completed(&self, completed: CompletedOperation) {
            #[allow(clippy::unwrap_used)]
            self.completed.lock().unwrap().push(completed);
        }
    }
}
