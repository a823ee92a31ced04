// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Pool selection topology snapshots and diffs
//!
//! A `PoolMonitorSnapshot` is the periodic refresh pushed from the pool
//! manager; `PoolInfoDiff` is what `PoolInfoMap::compare` derives from it
//! and `PoolInfoMap::apply` consumes. Keeping the diff explicit lets the
//! map rebuild incrementally instead of swapping wholesale.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::types::StorageUnitConstraints;

/// Read/write availability of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMode {
    pub enabled: bool,
    pub read: bool,
    pub write: bool,
}

impl PoolMode {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            read: true,
            write: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            read: false,
            write: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            enabled: true,
            read: true,
            write: false,
        }
    }

    pub fn can_read(&self) -> bool {
        self.enabled && self.read
    }

    pub fn can_write(&self) -> bool {
        self.enabled && self.write
    }
}

/// Space/load summary published by a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCostInfo {
    pub free_space: u64,
    pub total_space: u64,
    pub active_movers: u32,
}

/// One pool as described by the snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpec {
    pub name: String,
    pub mode: PoolMode,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub cost: Option<PoolCostInfo>,
    #[serde(default)]
    pub hsms: HashSet<String>,
}

impl PoolSpec {
    pub fn new(name: &str, mode: PoolMode) -> Self {
        Self {
            name: name.to_string(),
            mode,
            tags: HashMap::new(),
            cost: None,
            hsms: HashSet::new(),
        }
    }
}

/// One pool group as described by the snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolGroupSpec {
    pub name: String,
    pub primary: bool,
    pub pools: Vec<String>,
}

/// One storage unit as described by the snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageUnitSpec {
    pub name: String,
    pub constraints: StorageUnitConstraints,
    /// Pool groups this unit is linked to
    pub groups: Vec<String>,
}

/// The full topology as pushed by the pool manager
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolMonitorSnapshot {
    pub pools: Vec<PoolSpec>,
    pub groups: Vec<PoolGroupSpec>,
    pub units: Vec<StorageUnitSpec>,
}

/// Incremental changes between the indexed topology and a snapshot
#[derive(Debug, Clone, Default)]
pub struct PoolInfoDiff {
    pub new_pools: Vec<PoolSpec>,
    pub removed_pools: Vec<String>,
    /// (group, primary marker)
    pub new_groups: Vec<(String, bool)>,
    pub removed_groups: Vec<String>,
    pub new_units: Vec<String>,
    pub removed_units: Vec<String>,
    /// (group, pool) memberships to add / remove
    pub added_memberships: Vec<(String, String)>,
    pub removed_memberships: Vec<(String, String)>,
    /// (group, unit) links to add / remove
    pub added_unit_links: Vec<(String, String)>,
    pub removed_unit_links: Vec<(String, String)>,
    /// Groups whose primary marker flipped
    pub marker_changes: Vec<(String, bool)>,
    /// Units whose constraints changed, with the new constraints
    pub constraint_changes: HashMap<String, StorageUnitConstraints>,
    /// Pools whose mode / tags / cost / hsms changed, with the new spec
    pub updated_pools: Vec<PoolSpec>,
}

impl PoolInfoDiff {
    pub fn is_empty(&self) -> bool {
        self.new_pools.is_empty()
            && self.removed_pools.is_empty()
            && self.new_groups.is_empty()
            && self.removed_groups.is_empty()
            && self.new_units.is_empty()
            && self.removed_units.is_empty()
            && self.added_memberships.is_empty()
            && self.removed_memberships.is_empty()
            && self.added_unit_links.is_empty()
            && self.removed_unit_links.is_empty()
            && self.marker_changes.is_empty()
            && self.constraint_changes.is_empty()
            && self.updated_pools.is_empty()
    }
}
