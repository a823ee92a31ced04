// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Live index of the pool selection topology
//!
//! `PoolInfoMap` answers the scheduler's topology questions: which pools
//! belong to a group, whether a pool can currently serve reads or writes,
//! which storage-unit constraints apply, and which group is authoritative
//! for a file's locations. It is rebuilt incrementally from pool monitor
//! snapshots via `compare` / `apply`.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::topology::{PoolInfoDiff, PoolMode, PoolMonitorSnapshot, PoolSpec};
use crate::types::StorageUnitConstraints;

/// Suppresses repeats of a recurring alarm within a fixed window
///
/// Injected into the map rather than kept as process-global state so tests
/// can observe and reset it.
#[derive(Debug)]
pub struct AlarmRateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl AlarmRateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// True when the caller should emit the alarm now
    pub fn try_emit(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// What the index keeps per pool
#[derive(Debug, Clone)]
pub struct PoolInformation {
    pub mode: PoolMode,
    pub tags: HashMap<String, String>,
    pub cost: Option<crate::topology::PoolCostInfo>,
    pub hsms: HashSet<String>,
}

impl PoolInformation {
    fn from_spec(spec: &PoolSpec) -> Self {
        Self {
            mode: spec.mode,
            tags: spec.tags.clone(),
            cost: spec.cost,
            hsms: spec.hsms.clone(),
        }
    }

    pub fn can_read(&self) -> bool {
        self.mode.can_read()
    }

    pub fn can_write(&self) -> bool {
        self.mode.can_write()
    }
}

#[derive(Debug, Default)]
struct Topology {
    /// group name -> primary marker
    groups: HashMap<String, bool>,
    /// unit name -> constraints
    units: HashMap<String, StorageUnitConstraints>,
    pool_info: HashMap<String, PoolInformation>,
    group_pools: HashMap<String, HashSet<String>>,
    pool_groups: HashMap<String, HashSet<String>>,
    group_units: HashMap<String, HashSet<String>>,
    unit_groups: HashMap<String, HashSet<String>>,
}

/// The reader-writer-locked topology index
#[derive(Debug)]
pub struct PoolInfoMap {
    inner: RwLock<Topology>,
    /// Synthetic group standing in for "no (or ambiguous) primary group";
    /// membership queries against it resolve to all pools.
    system_pgroup: String,
    misconfig_alarm: AlarmRateLimiter,
}

fn read_lock(inner: &RwLock<Topology>) -> RwLockReadGuard<'_, Topology> {
    inner.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock(inner: &RwLock<Topology>) -> RwLockWriteGuard<'_, Topology> {
    inner.write().unwrap_or_else(|e| e.into_inner())
}

impl PoolInfoMap {
    pub fn new(alarm_interval: Duration) -> Self {
        Self {
            inner: RwLock::new(Topology::default()),
            system_pgroup: format!("system-{}", Uuid::new_v4()),
            misconfig_alarm: AlarmRateLimiter::new(alarm_interval),
        }
    }

    pub fn system_pool_group(&self) -> &str {
        &self.system_pgroup
    }

    /// Derive the incremental changes a snapshot implies
    pub fn compare(&self, snapshot: &PoolMonitorSnapshot) -> PoolInfoDiff {
        let topo = read_lock(&self.inner);
        let mut diff = PoolInfoDiff::default();

        let snap_pools: HashMap<&str, &PoolSpec> =
            snapshot.pools.iter().map(|p| (p.name.as_str(), p)).collect();
        let snap_groups: HashMap<&str, bool> = snapshot
            .groups
            .iter()
            .map(|g| (g.name.as_str(), g.primary))
            .collect();
        let snap_units: HashMap<&str, &StorageUnitConstraints> = snapshot
            .units
            .iter()
            .map(|u| (u.name.as_str(), &u.constraints))
            .collect();

        for (name, spec) in &snap_pools {
            match topo.pool_info.get(*name) {
                None => diff.new_pools.push((*spec).clone()),
                Some(info) => {
                    if info.mode != spec.mode
                        || info.tags != spec.tags
                        || info.cost != spec.cost
                        || info.hsms != spec.hsms
                    {
                        diff.updated_pools.push((*spec).clone());
                    }
                }
            }
        }
        for name in topo.pool_info.keys() {
            if !snap_pools.contains_key(name.as_str()) {
                diff.removed_pools.push(name.clone());
            }
        }

        for (name, primary) in &snap_groups {
            match topo.groups.get(*name) {
                None => diff.new_groups.push((name.to_string(), *primary)),
                Some(current) if current != primary => {
                    diff.marker_changes.push((name.to_string(), *primary));
                }
                Some(_) => {}
            }
        }
        for name in topo.groups.keys() {
            if !snap_groups.contains_key(name.as_str()) {
                diff.removed_groups.push(name.clone());
            }
        }

        for (name, constraints) in &snap_units {
            match topo.units.get(*name) {
                None => diff.new_units.push(name.to_string()),
                Some(current) if current != *constraints => {
                    diff.constraint_changes
                        .insert(name.to_string(), (*constraints).clone());
                }
                Some(_) => {}
            }
        }
        for name in topo.units.keys() {
            if !snap_units.contains_key(name.as_str()) {
                diff.removed_units.push(name.clone());
            }
        }
        // constraints for brand-new units travel with the diff too
        for unit in snapshot.units.iter() {
            if !topo.units.contains_key(&unit.name) {
                diff.constraint_changes
                    .insert(unit.name.clone(), unit.constraints.clone());
            }
        }

        let empty = HashSet::new();
        for group in &snapshot.groups {
            let current = topo.group_pools.get(&group.name).unwrap_or(&empty);
            for pool in &group.pools {
                if !current.contains(pool) {
                    diff.added_memberships
                        .push((group.name.clone(), pool.clone()));
                }
            }
            let snap_members: HashSet<&str> = group.pools.iter().map(String::as_str).collect();
            for pool in current {
                if !snap_members.contains(pool.as_str()) {
                    diff.removed_memberships
                        .push((group.name.clone(), pool.clone()));
                }
            }
        }
        for (group, pools) in &topo.group_pools {
            if !snap_groups.contains_key(group.as_str()) {
                for pool in pools {
                    diff.removed_memberships.push((group.clone(), pool.clone()));
                }
            }
        }

        let mut snap_links: HashSet<(String, String)> = HashSet::new();
        for unit in &snapshot.units {
            for group in &unit.groups {
                snap_links.insert((group.clone(), unit.name.clone()));
            }
        }
        for (group, unit) in &snap_links {
            if !topo
                .group_units
                .get(group)
                .is_some_and(|units| units.contains(unit))
            {
                diff.added_unit_links.push((group.clone(), unit.clone()));
            }
        }
        for (group, units) in &topo.group_units {
            for unit in units {
                if !snap_links.contains(&(group.clone(), unit.clone())) {
                    diff.removed_unit_links.push((group.clone(), unit.clone()));
                }
            }
        }

        diff
    }

    /// Apply an incremental diff; removals before additions
    pub fn apply(&self, diff: &PoolInfoDiff) {
        let mut topo = write_lock(&self.inner);

        for (group, pool) in &diff.removed_memberships {
            if let Some(pools) = topo.group_pools.get_mut(group) {
                pools.remove(pool);
            }
            if let Some(groups) = topo.pool_groups.get_mut(pool) {
                groups.remove(group);
            }
        }
        for (group, unit) in &diff.removed_unit_links {
            if let Some(units) = topo.group_units.get_mut(group) {
                units.remove(unit);
            }
            if let Some(groups) = topo.unit_groups.get_mut(unit) {
                groups.remove(group);
            }
        }
        for pool in &diff.removed_pools {
            topo.pool_info.remove(pool);
            if let Some(groups) = topo.pool_groups.remove(pool) {
                for group in groups {
                    if let Some(pools) = topo.group_pools.get_mut(&group) {
                        pools.remove(pool);
                    }
                }
            }
        }
        for group in &diff.removed_groups {
            topo.groups.remove(group);
            if let Some(pools) = topo.group_pools.remove(group) {
                for pool in pools {
                    if let Some(groups) = topo.pool_groups.get_mut(&pool) {
                        groups.remove(group);
                    }
                }
            }
            if let Some(units) = topo.group_units.remove(group) {
                for unit in units {
                    if let Some(groups) = topo.unit_groups.get_mut(&unit) {
                        groups.remove(group);
                    }
                }
            }
        }
        for unit in &diff.removed_units {
            topo.units.remove(unit);
            if let Some(groups) = topo.unit_groups.remove(unit) {
                for group in groups {
                    if let Some(units) = topo.group_units.get_mut(&group) {
                        units.remove(unit);
                    }
                }
            }
        }

        for spec in &diff.new_pools {
            topo.pool_info
                .insert(spec.name.clone(), PoolInformation::from_spec(spec));
            topo.pool_groups.entry(spec.name.clone()).or_default();
        }
        for (group, primary) in &diff.new_groups {
            topo.groups.insert(group.clone(), *primary);
            topo.group_pools.entry(group.clone()).or_default();
            topo.group_units.entry(group.clone()).or_default();
        }
        for unit in &diff.new_units {
            topo.units.entry(unit.clone()).or_default();
            topo.unit_groups.entry(unit.clone()).or_default();
        }
        for (group, pool) in &diff.added_memberships {
            topo.group_pools
                .entry(group.clone())
                .or_default()
                .insert(pool.clone());
            topo.pool_groups
                .entry(pool.clone())
                .or_default()
                .insert(group.clone());
        }
        for (group, unit) in &diff.added_unit_links {
            topo.group_units
                .entry(group.clone())
                .or_default()
                .insert(unit.clone());
            topo.unit_groups
                .entry(unit.clone())
                .or_default()
                .insert(group.clone());
        }
        for (group, primary) in &diff.marker_changes {
            topo.groups.insert(group.clone(), *primary);
        }
        for (unit, constraints) in &diff.constraint_changes {
            topo.units.insert(unit.clone(), constraints.clone());
        }
        for spec in &diff.updated_pools {
            topo.pool_info
                .insert(spec.name.clone(), PoolInformation::from_spec(spec));
        }
    }

    /// Compare-and-apply convenience for a fresh snapshot
    pub fn refresh(&self, snapshot: &PoolMonitorSnapshot) -> PoolInfoDiff {
        let diff = self.compare(snapshot);
        if !diff.is_empty() {
            self.apply(&diff);
        }
        diff
    }

    pub fn has_pool(&self, pool: &str) -> bool {
        read_lock(&self.inner).pool_info.contains_key(pool)
    }

    pub fn pools(&self) -> Vec<String> {
        read_lock(&self.inner).pool_info.keys().cloned().collect()
    }

    pub fn pool_groups(&self) -> Vec<String> {
        read_lock(&self.inner).groups.keys().cloned().collect()
    }

    pub fn storage_units(&self) -> Vec<String> {
        read_lock(&self.inner).units.keys().cloned().collect()
    }

    pub fn pool_information(&self, pool: &str) -> Option<PoolInformation> {
        read_lock(&self.inner).pool_info.get(pool).cloned()
    }

    pub fn tags(&self, pool: &str) -> HashMap<String, String> {
        read_lock(&self.inner)
            .pool_info
            .get(pool)
            .map(|i| i.tags.clone())
            .unwrap_or_default()
    }

    pub fn constraints(&self, unit: &str) -> Option<StorageUnitConstraints> {
        read_lock(&self.inner).units.get(unit).cloned()
    }

    pub fn groups_of_pool(&self, pool: &str) -> Vec<String> {
        read_lock(&self.inner)
            .pool_groups
            .get(pool)
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn units_for_group(&self, group: &str) -> Vec<String> {
        read_lock(&self.inner)
            .group_units
            .get(group)
            .map(|u| u.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the pool can currently serve the requested access
    pub fn is_viable(&self, pool: &str, writable: bool) -> bool {
        read_lock(&self.inner)
            .pool_info
            .get(pool)
            .is_some_and(|info| if writable { info.can_write() } else { info.can_read() })
    }

    /// Viable members of a group; the system group spans all pools
    pub fn member_pools(&self, group: &str, writable: bool) -> Vec<String> {
        let topo = read_lock(&self.inner);
        let viable = |name: &str| {
            topo.pool_info
                .get(name)
                .is_some_and(|info| if writable { info.can_write() } else { info.can_read() })
        };
        if group == self.system_pgroup {
            let mut pools: Vec<String> = topo
                .pool_info
                .keys()
                .filter(|p| viable(p.as_str()))
                .cloned()
                .collect();
            pools.sort();
            return pools;
        }
        let mut pools: Vec<String> = topo
            .group_pools
            .get(group)
            .map(|members| {
                members
                    .iter()
                    .filter(|p| viable(p.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        pools.sort();
        pools
    }

    /// The sole primary group of a pool, if unambiguous
    ///
    /// A pool resolving to more than one primary group is a pool manager
    /// misconfiguration; it raises a rate-limited alarm and resolves to
    /// none rather than failing the caller.
    pub fn primary_group_of(&self, pool: &str) -> Option<String> {
        let topo = read_lock(&self.inner);
        let mut primaries = topo
            .pool_groups
            .get(pool)
            .into_iter()
            .flatten()
            .filter(|g| topo.groups.get(*g).copied().unwrap_or(false));
        let first = primaries.next()?.clone();
        if let Some(second) = primaries.next() {
            if self.misconfig_alarm.try_emit() {
                tracing::warn!(
                    pool = %pool,
                    first = %first,
                    second = %second,
                    "pool belongs to more than one primary group; \
                     check the pool manager configuration"
                );
            }
            return None;
        }
        Some(first)
    }

    /// The group that governs replication for a file's locations
    ///
    /// When every location resolves to the same single primary group, that
    /// group is authoritative; anything else (no primary group, ambiguous
    /// membership, disagreeing locations) falls back to the system group.
    pub fn effective_pool_group(&self, locations: &HashSet<String>) -> String {
        let mut resolved: HashSet<String> = HashSet::new();
        for pool in locations {
            match self.primary_group_of(pool) {
                Some(group) => {
                    resolved.insert(group);
                }
                None => return self.system_pgroup.clone(),
            }
        }
        if resolved.len() == 1 {
            if let Some(group) = resolved.into_iter().next() {
                return group;
            }
        }
        self.system_pgroup.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{PoolGroupSpec, StorageUnitSpec};

    fn snapshot() -> PoolMonitorSnapshot {
        let mut unit_tags = HashSet::new();
        unit_tags.insert("hostname".to_string());
        PoolMonitorSnapshot {
            pools: vec![
                PoolSpec::new("pool-a", PoolMode::enabled()),
                PoolSpec::new("pool-b", PoolMode::enabled()),
                PoolSpec::new("pool-c", PoolMode::read_only()),
            ],
            groups: vec![
                PoolGroupSpec {
                    name: "resilient".to_string(),
                    primary: true,
                    pools: vec!["pool-a".to_string(), "pool-b".to_string()],
                },
                PoolGroupSpec {
                    name: "tape".to_string(),
                    primary: false,
                    pools: vec!["pool-c".to_string()],
                },
            ],
            units: vec![StorageUnitSpec {
                name: "atlas:default".to_string(),
                constraints: StorageUnitConstraints::new(Some(2), unit_tags),
                groups: vec!["resilient".to_string()],
            }],
        }
    }

    fn map() -> PoolInfoMap {
        let map = PoolInfoMap::new(Duration::from_secs(60));
        map.refresh(&snapshot());
        map
    }

    #[test]
    fn refresh_from_empty_indexes_everything() {
        let map = map();
        let mut pools = map.pools();
        pools.sort();
        assert_eq!(pools, vec!["pool-a", "pool-b", "pool-c"]);
        assert!(map.pool_groups().contains(&"resilient".to_string()));
        assert_eq!(map.storage_units(), vec!["atlas:default"]);
        assert_eq!(
            map.constraints("atlas:default").and_then(|c| c.required),
            Some(2)
        );
    }

    #[test]
    fn refresh_is_idempotent() {
        let map = map();
        let diff = map.refresh(&snapshot());
        assert!(diff.is_empty());
    }

    #[test]
    fn member_pools_filters_by_viability() {
        let map = map();
        assert_eq!(map.member_pools("resilient", true), vec!["pool-a", "pool-b"]);
        // pool-c is read-only: visible for reads, not writes
        assert_eq!(map.member_pools("tape", false), vec!["pool-c"]);
        assert!(map.member_pools("tape", true).is_empty());
    }

    #[test]
    fn system_group_spans_all_pools() {
        let map = map();
        let system = map.system_pool_group().to_string();
        assert_eq!(
            map.member_pools(&system, false),
            vec!["pool-a", "pool-b", "pool-c"]
        );
        assert_eq!(map.member_pools(&system, true), vec!["pool-a", "pool-b"]);
    }

    #[test]
    fn unknown_group_has_no_members() {
        let map = map();
        assert!(map.member_pools("nope", false).is_empty());
    }

    #[test]
    fn effective_group_resolves_sole_primary() {
        let map = map();
        let locations: HashSet<String> =
            ["pool-a".to_string(), "pool-b".to_string()].into_iter().collect();
        assert_eq!(map.effective_pool_group(&locations), "resilient");
    }

    #[test]
    fn effective_group_falls_back_to_system() {
        let map = map();
        // pool-c has no primary group
        let locations: HashSet<String> = ["pool-c".to_string()].into_iter().collect();
        assert_eq!(
            map.effective_pool_group(&locations),
            map.system_pool_group()
        );
    }

    #[test]
    fn ambiguous_primary_membership_degrades_to_system() {
        let map = map();
        // second primary group also containing pool-a: misconfiguration
        let mut snap = snapshot();
        snap.groups.push(PoolGroupSpec {
            name: "resilient2".to_string(),
            primary: true,
            pools: vec!["pool-a".to_string()],
        });
        map.refresh(&snap);

        assert_eq!(map.primary_group_of("pool-a"), None);
        let locations: HashSet<String> = ["pool-a".to_string()].into_iter().collect();
        assert_eq!(
            map.effective_pool_group(&locations),
            map.system_pool_group()
        );
        // pool-b is unaffected
        assert_eq!(map.primary_group_of("pool-b").as_deref(), Some("resilient"));
    }

    #[test]
    fn mode_change_shows_up_as_updated_pool() {
        let map = map();
        let mut snap = snapshot();
        snap.pools[0].mode = PoolMode::disabled();
        let diff = map.compare(&snap);
        assert_eq!(diff.updated_pools.len(), 1);
        assert_eq!(diff.updated_pools[0].name, "pool-a");
        map.apply(&diff);
        assert!(!map.is_viable("pool-a", false));
        assert!(!map.member_pools("resilient", true).contains(&"pool-a".to_string()));
    }

    #[test]
    fn removing_a_pool_strips_memberships() {
        let map = map();
        let mut snap = snapshot();
        snap.pools.retain(|p| p.name != "pool-b");
        for group in &mut snap.groups {
            group.pools.retain(|p| p != "pool-b");
        }
        let diff = map.compare(&snap);
        assert_eq!(diff.removed_pools, vec!["pool-b"]);
        map.apply(&diff);
        assert!(!map.has_pool("pool-b"));
        assert_eq!(map.member_pools("resilient", true), vec!["pool-a"]);
    }

    #[test]
    fn constraint_change_is_applied() {
        let map = map();
        let mut snap = snapshot();
        snap.units[0].constraints.required = Some(3);
        let diff = map.compare(&snap);
        assert!(diff.constraint_changes.contains_key("atlas:default"));
        map.apply(&diff);
        assert_eq!(
            map.constraints("atlas:default").and_then(|c| c.required),
            Some(3)
        );
    }

    #[test]
    fn alarm_rate_limiter_suppresses_repeats() {
        let limiter = AlarmRateLimiter::new(Duration::from_secs(3600));
        assert!(limiter.try_emit());
        assert!(!limiter.try_emit());
        assert!(!limiter.try_emit());
    }
}
