// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Criterion over verification operations
//!
//! One filter type serves both the in-memory match (listing, cancellation)
//! and the store-side WHERE clause, so the two can never drift apart.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::operation::VerifyOperation;
use crate::types::{PnfsId, QoSAction, QoSMessageType, VerifyOperationState};

#[derive(Debug, Clone, Default)]
pub struct VerifyOperationFilter {
    pub pnfs_ids: Option<HashSet<PnfsId>>,
    pub message_types: Option<HashSet<QoSMessageType>>,
    pub states: Option<HashSet<VerifyOperationState>>,
    pub action: Option<QoSAction>,
    pub parent: Option<String>,
    pub source: Option<String>,
    pub target: Option<String>,
    /// Matches the pool in any role (parent, source or target)
    pub pool: Option<String>,
    pub pool_group: Option<String>,
    pub storage_unit: Option<String>,
    pub retried_at_least: Option<u32>,
    pub arrived_before: Option<DateTime<Utc>>,
    pub arrived_after: Option<DateTime<Utc>>,
}

impl VerifyOperationFilter {
    /// A filter with no criteria matches everything; cancellation rejects it
    pub fn is_empty(&self) -> bool {
        self.pnfs_ids.is_none()
            && self.message_types.is_none()
            && self.states.is_none()
            && self.action.is_none()
            && self.parent.is_none()
            && self.source.is_none()
            && self.target.is_none()
            && self.pool.is_none()
            && self.pool_group.is_none()
            && self.storage_unit.is_none()
            && self.retried_at_least.is_none()
            && self.arrived_before.is_none()
            && self.arrived_after.is_none()
    }

    pub fn matches(&self, op: &VerifyOperation) -> bool {
        if let Some(ids) = &self.pnfs_ids {
            if !ids.contains(&op.pnfs_id) {
                return false;
            }
        }
        if let Some(types) = &self.message_types {
            if !types.contains(&op.message_type) {
                return false;
            }
        }
        if let Some(states) = &self.states {
            if !states.contains(&op.state) {
                return false;
            }
        }
        if let Some(action) = self.action {
            if op.action != Some(action) {
                return false;
            }
        }
        if let Some(parent) = &self.parent {
            if op.parent.as_deref() != Some(parent.as_str()) {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if op.source.as_deref() != Some(source.as_str()) {
                return false;
            }
        }
        if let Some(target) = &self.target {
            if op.target.as_deref() != Some(target.as_str()) {
                return false;
            }
        }
        if let Some(pool) = &self.pool {
            let hit = op.parent.as_deref() == Some(pool.as_str())
                || op.source.as_deref() == Some(pool.as_str())
                || op.target.as_deref() == Some(pool.as_str());
            if !hit {
                return false;
            }
        }
        if let Some(group) = &self.pool_group {
            if op.pool_group.as_deref() != Some(group.as_str()) {
                return false;
            }
        }
        if let Some(unit) = &self.storage_unit {
            if op.storage_unit.as_deref() != Some(unit.as_str()) {
                return false;
            }
        }
        if let Some(retried) = self.retried_at_least {
            if op.retried < retried {
                return false;
            }
        }
        if let Some(before) = self.arrived_before {
            if op.arrived >= before {
                return false;
            }
        }
        if let Some(after) = self.arrived_after {
            if op.arrived <= after {
                return false;
            }
        }
        true
    }
}

/// A cancellation request; forced removal also deletes from the store
#[derive(Debug, Clone, Default)]
pub struct VerifyOperationCancelFilter {
    pub filter: VerifyOperationFilter,
    pub should_remove: bool,
}

impl VerifyOperationCancelFilter {
    /// Cancel everything touching a pool; `only_parent` restricts the match
    /// to scan operations whose parent is the pool.
    pub fn for_pool(pool: &str, only_parent: bool, should_remove: bool) -> Self {
        let mut filter = VerifyOperationFilter::default();
        if only_parent {
            filter.parent = Some(pool.to_string());
        } else {
            filter.pool = Some(pool.to_string());
        }
        Self {
            filter,
            should_remove,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileQoSUpdate;

    fn op() -> VerifyOperation {
        let update = FileQoSUpdate::new("0000AAAA".into(), QoSMessageType::AddCacheLocation)
            .with_pool("pool-1")
            .with_storage_unit("atlas:default");
        let mut op = VerifyOperation::new(&update, Utc::now());
        op.make_ready();
        op.target = Some("pool-2".to_string());
        op
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = VerifyOperationFilter::default();
        assert!(filter.is_empty());
        assert!(filter.matches(&op()));
    }

    #[test]
    fn pnfsid_filter() {
        let mut filter = VerifyOperationFilter::default();
        filter.pnfs_ids = Some([PnfsId::from("0000AAAA")].into_iter().collect());
        assert!(!filter.is_empty());
        assert!(filter.matches(&op()));

        filter.pnfs_ids = Some([PnfsId::from("0000BBBB")].into_iter().collect());
        assert!(!filter.matches(&op()));
    }

    #[test]
    fn state_and_type_filters() {
        let mut filter = VerifyOperationFilter::default();
        filter.states = Some([VerifyOperationState::Ready].into_iter().collect());
        filter.message_types = Some([QoSMessageType::AddCacheLocation].into_iter().collect());
        assert!(filter.matches(&op()));

        filter.states = Some([VerifyOperationState::Running].into_iter().collect());
        assert!(!filter.matches(&op()));
    }

    #[test]
    fn pool_filter_matches_any_role() {
        let mut filter = VerifyOperationFilter::default();
        filter.pool = Some("pool-2".to_string());
        assert!(filter.matches(&op()), "matches as target");

        filter.pool = Some("pool-1".to_string());
        assert!(filter.matches(&op()), "matches as source");

        filter.pool = Some("pool-9".to_string());
        assert!(!filter.matches(&op()));
    }

    #[test]
    fn parent_filter_does_not_match_source() {
        let mut filter = VerifyOperationFilter::default();
        filter.parent = Some("pool-1".to_string());
        assert!(!filter.matches(&op()));
    }

    #[test]
    fn retried_floor() {
        let mut filter = VerifyOperationFilter::default();
        filter.retried_at_least = Some(1);
        let mut o = op();
        assert!(!filter.matches(&o));
        o.retried = 1;
        assert!(filter.matches(&o));
    }

    #[test]
    fn arrival_window() {
        let o = op();
        let mut filter = VerifyOperationFilter::default();
        filter.arrived_before = Some(o.arrived + chrono::Duration::seconds(1));
        filter.arrived_after = Some(o.arrived - chrono::Duration::seconds(1));
        assert!(filter.matches(&o));

        filter.arrived_after = Some(o.arrived);
        assert!(!filter.matches(&o));
    }

    #[test]
    fn pool_cancel_filter_shapes() {
        let scan = VerifyOperationCancelFilter::for_pool("pool-1", true, false);
        assert_eq!(scan.filter.parent.as_deref(), Some("pool-1"));
        assert!(scan.filter.pool.is_none());

        let any = VerifyOperationCancelFilter::for_pool("pool-1", false, true);
        assert_eq!(any.filter.pool.as_deref(), Some("pool-1"));
        assert!(any.should_remove);
    }
}
