//! In-memory usage accounting
//!
//! One tree: group key -> per-persistence-type aggregate -> per-origin
//! record, guarded by a single coarse lock. This is the only structure
//! touched from both the owning thread and the IO thread. The critical
//! section never calls into filesystem or notification machinery.
//!
//! Persistent-type origins bypass this structure entirely: they are
//! trusted unconditionally and never measured for eviction.
//!
//! All accounting arithmetic is checked; an overflow or underflow means
//! the counters can no longer be trusted and terminates the process.

use parking_lot::Mutex;
use quotastore_common::{
    BEST_EFFORT_PERSISTENCE_TYPES, ClientType, ClientUsageArray, FullOriginMetadata,
    OriginMetadata, PersistenceType, error::fatal_invariant,
};
use quotastore_db::OriginRow;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Checked accounting addition.
fn add(a: u64, b: u64) -> u64 {
    a.checked_add(b)
        .unwrap_or_else(|| fatal_invariant("usage accounting overflow"))
}

/// Checked accounting subtraction.
fn sub(a: u64, b: u64) -> u64 {
    a.checked_sub(b)
        .unwrap_or_else(|| fatal_invariant("usage accounting underflow"))
}

/// Usage record for one origin, owned by its group aggregate.
#[derive(Clone, Debug)]
pub(crate) struct OriginInfo {
    pub metadata: OriginMetadata,
    pub client_usages: ClientUsageArray,
    pub usage: u64,
    pub last_access_time: i64,
    pub accessed: bool,
    pub persisted: bool,
    pub directory_exists: bool,
    /// Live per-file size handles: path -> (current size, handle count).
    pub quota_objects: HashMap<PathBuf, QuotaObjectEntry>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct QuotaObjectEntry {
    pub size: u64,
    pub refs: usize,
}

impl OriginInfo {
    pub(crate) fn full_metadata(&self) -> FullOriginMetadata {
        FullOriginMetadata {
            metadata: self.metadata.clone(),
            persisted: self.persisted,
            last_access_time: self.last_access_time,
        }
    }
}

/// Aggregate for one (persistence type, group) pair.
#[derive(Clone, Debug, Default)]
pub(crate) struct GroupInfo {
    pub usage: u64,
    pub origins: BTreeMap<String, OriginInfo>,
}

/// Up to three aggregates (temporary/default/private) for one group key.
#[derive(Clone, Debug, Default)]
pub(crate) struct GroupInfoPair {
    slots: [Option<GroupInfo>; BEST_EFFORT_PERSISTENCE_TYPES.len()],
}

fn slot_index(persistence_type: PersistenceType) -> usize {
    match persistence_type {
        PersistenceType::Temporary => 0,
        PersistenceType::Default => 1,
        PersistenceType::Private => 2,
        PersistenceType::Persistent => {
            fatal_invariant("persistent origins are not quota-tracked")
        }
    }
}

impl GroupInfoPair {
    pub(crate) fn get(&self, persistence_type: PersistenceType) -> Option<&GroupInfo> {
        self.slots[slot_index(persistence_type)].as_ref()
    }

    pub(crate) fn get_mut(
        &mut self,
        persistence_type: PersistenceType,
    ) -> Option<&mut GroupInfo> {
        self.slots[slot_index(persistence_type)].as_mut()
    }

    fn get_or_insert(&mut self, persistence_type: PersistenceType) -> &mut GroupInfo {
        self.slots[slot_index(persistence_type)].get_or_insert_with(GroupInfo::default)
    }

    fn remove(&mut self, persistence_type: PersistenceType) -> Option<GroupInfo> {
        self.slots[slot_index(persistence_type)].take()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (PersistenceType, &GroupInfo)> {
        BEST_EFFORT_PERSISTENCE_TYPES
            .into_iter()
            .filter_map(|t| self.get(t).map(|g| (t, g)))
    }

    fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Sum of this group's usage across its aggregates.
    pub(crate) fn usage(&self) -> u64 {
        self.iter().fold(0, |acc, (_, group)| add(acc, group.usage))
    }
}

pub(crate) struct TrackerState {
    pub(crate) groups: BTreeMap<String, GroupInfoPair>,
    pub(crate) temporary_storage_usage: u64,
    pub(crate) temporary_storage_limit: Option<u64>,
}

impl TrackerState {
    pub(crate) fn origin(
        &self,
        persistence_type: PersistenceType,
        group: &str,
        origin: &str,
    ) -> Option<&OriginInfo> {
        self.groups
            .get(group)?
            .get(persistence_type)?
            .origins
            .get(origin)
    }

    fn origin_mut(
        &mut self,
        persistence_type: PersistenceType,
        group: &str,
        origin: &str,
    ) -> Option<&mut OriginInfo> {
        self.groups
            .get_mut(group)?
            .get_mut(persistence_type)?
            .origins
            .get_mut(origin)
    }
}

/// Outcome of a quota object resize attempt while the lock is held.
enum ResizeOutcome {
    Applied,
    /// The growth would push the pool over its limit by this many bytes.
    NeedsBytes(u64),
    /// The backing origin record is gone.
    Gone,
}

/// The shared usage-accounting tree.
pub struct UsageTracker {
    inner: Mutex<TrackerState>,
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerState {
                groups: BTreeMap::new(),
                temporary_storage_usage: 0,
                temporary_storage_limit: None,
            }),
        }
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&TrackerState) -> R) -> R {
        f(&self.inner.lock())
    }

    /// Global limit for the best-effort pool; `None` until temporary
    /// storage has been initialized.
    #[must_use]
    pub fn limit(&self) -> Option<u64> {
        self.inner.lock().temporary_storage_limit
    }

    pub fn set_limit(&self, limit: u64) {
        self.inner.lock().temporary_storage_limit = Some(limit);
    }

    /// Process-wide best-effort usage counter.
    #[must_use]
    pub fn total_usage(&self) -> u64 {
        self.inner.lock().temporary_storage_usage
    }

    /// Insert (or replace) the record for one origin with measured
    /// client usages.
    pub fn init_origin(
        &self,
        full: &FullOriginMetadata,
        client_usages: ClientUsageArray,
        accessed: bool,
        directory_exists: bool,
    ) {
        let persistence_type = full.metadata.persistence_type;
        if !persistence_type.is_best_effort() {
            return;
        }
        let usage = client_usages.total();

        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let group = state
            .groups
            .entry(full.metadata.group.clone())
            .or_default()
            .get_or_insert(persistence_type);

        // Re-initialization replaces the previous measurement.
        let old = group
            .origins
            .get(&full.metadata.origin)
            .map_or(0, |existing| existing.usage);
        group.usage = add(sub(group.usage, old), usage);
        group.origins.insert(
            full.metadata.origin.clone(),
            OriginInfo {
                metadata: full.metadata.clone(),
                client_usages,
                usage,
                last_access_time: full.last_access_time,
                accessed,
                persisted: full.persisted,
                directory_exists,
                quota_objects: HashMap::new(),
            },
        );
        state.temporary_storage_usage =
            add(sub(state.temporary_storage_usage, old), usage);
        debug!(
            origin = %full.metadata.origin,
            usage,
            total = state.temporary_storage_usage,
            "origin usage initialized"
        );
    }

    /// Insert a zero-usage record for a just-created origin directory if
    /// none exists yet.
    pub fn ensure_origin(&self, full: &FullOriginMetadata) {
        let persistence_type = full.metadata.persistence_type;
        if !persistence_type.is_best_effort() {
            return;
        }
        let mut state = self.inner.lock();
        let group = state
            .groups
            .entry(full.metadata.group.clone())
            .or_default()
            .get_or_insert(persistence_type);
        group
            .origins
            .entry(full.metadata.origin.clone())
            .or_insert_with(|| OriginInfo {
                metadata: full.metadata.clone(),
                client_usages: ClientUsageArray::default(),
                usage: 0,
                last_access_time: full.last_access_time,
                accessed: true,
                persisted: full.persisted,
                directory_exists: true,
                quota_objects: HashMap::new(),
            });
    }

    #[must_use]
    pub fn has_origin(&self, metadata: &OriginMetadata) -> bool {
        if !metadata.persistence_type.is_best_effort() {
            return false;
        }
        self.inner
            .lock()
            .origin(metadata.persistence_type, &metadata.group, &metadata.origin)
            .is_some()
    }

    /// Grow one client's usage.
    pub fn increase_usage_for_client(
        &self,
        metadata: &OriginMetadata,
        client: ClientType,
        delta: u64,
    ) {
        self.apply_client_delta(metadata, client, delta, true);
    }

    /// Shrink one client's usage.
    pub fn decrease_usage_for_client(
        &self,
        metadata: &OriginMetadata,
        client: ClientType,
        delta: u64,
    ) {
        self.apply_client_delta(metadata, client, delta, false);
    }

    fn apply_client_delta(
        &self,
        metadata: &OriginMetadata,
        client: ClientType,
        delta: u64,
        grow: bool,
    ) {
        if !metadata.persistence_type.is_best_effort() || delta == 0 {
            return;
        }
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let Some(origin) =
            state.origin_mut(metadata.persistence_type, &metadata.group, &metadata.origin)
        else {
            return;
        };
        let client_usage = origin.client_usages.get(client).unwrap_or(0);
        let (new_client, apply): (u64, fn(u64, u64) -> u64) = if grow {
            (add(client_usage, delta), add)
        } else {
            (sub(client_usage, delta), sub)
        };
        origin.client_usages.set(client, Some(new_client));
        origin.usage = apply(origin.usage, delta);

        let group = state
            .groups
            .get_mut(&metadata.group)
            .and_then(|pair| pair.get_mut(metadata.persistence_type))
            .unwrap_or_else(|| fatal_invariant("origin without owning group"));
        group.usage = apply(group.usage, delta);
        state.temporary_storage_usage = apply(state.temporary_storage_usage, delta);
    }

    /// Replace one client's measured usage (used on re-initialization).
    pub fn reset_usage_for_client(
        &self,
        metadata: &OriginMetadata,
        client: ClientType,
        usage: Option<u64>,
    ) {
        if !metadata.persistence_type.is_best_effort() {
            return;
        }
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let Some(origin) =
            state.origin_mut(metadata.persistence_type, &metadata.group, &metadata.origin)
        else {
            return;
        };
        let old = origin.client_usages.get(client).unwrap_or(0);
        let new = usage.unwrap_or(0);
        origin.client_usages.set(client, usage);
        origin.usage = add(sub(origin.usage, old), new);

        let group = state
            .groups
            .get_mut(&metadata.group)
            .and_then(|pair| pair.get_mut(metadata.persistence_type))
            .unwrap_or_else(|| fatal_invariant("origin without owning group"));
        group.usage = add(sub(group.usage, old), new);
        state.temporary_storage_usage =
            add(sub(state.temporary_storage_usage, old), new);
    }

    /// Bump an origin's access time (and its accessed flag).
    pub fn update_access_time(&self, metadata: &OriginMetadata, timestamp: i64) {
        if !metadata.persistence_type.is_best_effort() {
            return;
        }
        let mut state = self.inner.lock();
        if let Some(origin) =
            state.origin_mut(metadata.persistence_type, &metadata.group, &metadata.origin)
        {
            origin.last_access_time = timestamp;
            origin.accessed = true;
        }
    }

    /// Whether the default-persistence record for the origin is pinned.
    #[must_use]
    pub fn origin_persisted(&self, metadata: &OriginMetadata) -> bool {
        self.inner
            .lock()
            .origin(PersistenceType::Default, &metadata.group, &metadata.origin)
            .is_some_and(|origin| origin.persisted)
    }

    pub fn set_origin_persisted(&self, metadata: &OriginMetadata, persisted: bool) {
        let mut state = self.inner.lock();
        if let Some(origin) =
            state.origin_mut(PersistenceType::Default, &metadata.group, &metadata.origin)
        {
            origin.persisted = persisted;
        }
    }

    /// Tracked usage of an origin summed across the best-effort types.
    #[must_use]
    pub fn origin_usage(&self, metadata: &OriginMetadata) -> u64 {
        let state = self.inner.lock();
        let Some(pair) = state.groups.get(&metadata.group) else {
            return 0;
        };
        pair.iter()
            .filter_map(|(_, group)| group.origins.get(&metadata.origin))
            .fold(0, |acc, origin| add(acc, origin.usage))
    }

    /// Tracked usage of one client within an origin.
    #[must_use]
    pub fn client_usage(&self, metadata: &OriginMetadata, client: ClientType) -> Option<u64> {
        self.inner
            .lock()
            .origin(metadata.persistence_type, &metadata.group, &metadata.origin)
            .and_then(|origin| origin.client_usages.get(client))
    }

    /// Combined usage of a group across its aggregates.
    #[must_use]
    pub fn group_usage(&self, group: &str) -> u64 {
        self.inner
            .lock()
            .groups
            .get(group)
            .map_or(0, GroupInfoPair::usage)
    }

    /// Usage/limit pair reported to storage-estimate callers: a
    /// persisted default-type origin sees the global pool, everything
    /// else its group.
    #[must_use]
    pub fn usage_and_limit_for_estimate(
        &self,
        metadata: &OriginMetadata,
        group_limit: u64,
    ) -> (u64, u64) {
        let state = self.inner.lock();
        let global_limit = state.temporary_storage_limit.unwrap_or(0);

        if let Some(pair) = state.groups.get(&metadata.group) {
            let persisted = pair
                .get(PersistenceType::Default)
                .and_then(|g| g.origins.get(&metadata.origin))
                .is_some_and(|origin| origin.persisted);
            if persisted {
                return (state.temporary_storage_usage, global_limit);
            }
            return (pair.usage(), group_limit);
        }
        (0, group_limit)
    }

    /// Remove an origin record, releasing its usage. Returns the freed
    /// byte count.
    pub fn remove_origin(&self, metadata: &OriginMetadata) -> u64 {
        if !metadata.persistence_type.is_best_effort() {
            return 0;
        }
        let mut state = self.inner.lock();
        let Some(pair) = state.groups.get_mut(&metadata.group) else {
            return 0;
        };
        let Some(group) = pair.get_mut(metadata.persistence_type) else {
            return 0;
        };
        let Some(origin) = group.origins.remove(&metadata.origin) else {
            return 0;
        };
        group.usage = sub(group.usage, origin.usage);
        if group.origins.is_empty() {
            pair.remove(metadata.persistence_type);
        }
        if pair.is_empty() {
            state.groups.remove(&metadata.group);
        }
        state.temporary_storage_usage = sub(state.temporary_storage_usage, origin.usage);
        origin.usage
    }

    /// Remove every record of one repository (persistence type).
    pub fn remove_repository(&self, persistence_type: PersistenceType) {
        if !persistence_type.is_best_effort() {
            return;
        }
        let mut state = self.inner.lock();
        let mut freed = 0u64;
        state.groups.retain(|_, pair| {
            if let Some(group) = pair.remove(persistence_type) {
                freed = add(freed, group.usage);
            }
            !pair.is_empty()
        });
        state.temporary_storage_usage = sub(state.temporary_storage_usage, freed);
    }

    /// Drop every record and reset the global counter.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.groups.clear();
        state.temporary_storage_usage = 0;
    }

    /// Like [`Self::clear`], but also disarms the global limit (used
    /// when the storage connection is torn down).
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        state.groups.clear();
        state.temporary_storage_usage = 0;
        state.temporary_storage_limit = None;
    }

    /// Flatten the tree into cache rows for the usage cache. Origins
    /// without an on-disk directory and private-browsing origins are
    /// not written out.
    #[must_use]
    pub fn snapshot_rows(&self) -> Vec<(PersistenceType, OriginRow)> {
        let state = self.inner.lock();
        let mut rows = Vec::new();
        for pair in state.groups.values() {
            for (persistence_type, group) in pair.iter() {
                for origin in group.origins.values() {
                    if !origin.directory_exists || origin.metadata.is_private {
                        continue;
                    }
                    rows.push((
                        persistence_type,
                        OriginRow {
                            suffix: origin.metadata.suffix.clone(),
                            group: origin.metadata.group.clone(),
                            origin: origin.metadata.origin.clone(),
                            client_usages: origin.client_usages.serialize(),
                            usage: origin.usage,
                            last_access_time: origin.last_access_time,
                            accessed: origin.accessed,
                            persisted: origin.persisted,
                        },
                    ));
                }
            }
        }
        rows
    }

    // ---- Quota objects ----

    /// Obtain a per-file size handle. Returns `None` for persistent
    /// origins (not tracked) and for origins without a record.
    #[must_use]
    pub fn get_quota_object(
        self: &Arc<Self>,
        metadata: &OriginMetadata,
        client: ClientType,
        path: PathBuf,
        file_size: u64,
        gate: Arc<dyn EvictionGate>,
    ) -> Option<QuotaObject> {
        if !metadata.persistence_type.is_best_effort() {
            return None;
        }
        {
            let mut state = self.inner.lock();
            let origin =
                state.origin_mut(metadata.persistence_type, &metadata.group, &metadata.origin)?;
            origin
                .quota_objects
                .entry(path.clone())
                .and_modify(|entry| entry.refs += 1)
                .or_insert(QuotaObjectEntry {
                    size: file_size,
                    refs: 1,
                });
        }
        Some(QuotaObject {
            shared: Arc::new(QuotaObjectShared {
                tracker: Arc::clone(self),
                gate,
                metadata: metadata.clone(),
                client,
                path,
            }),
        })
    }

    fn resize_quota_object(
        &self,
        metadata: &OriginMetadata,
        client: ClientType,
        path: &PathBuf,
        new_size: u64,
    ) -> ResizeOutcome {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let limit = state.temporary_storage_limit;
        let global = state.temporary_storage_usage;
        let Some(origin) =
            state.origin_mut(metadata.persistence_type, &metadata.group, &metadata.origin)
        else {
            return ResizeOutcome::Gone;
        };
        let Some(entry) = origin.quota_objects.get(path) else {
            return ResizeOutcome::Gone;
        };
        let old_size = entry.size;

        if new_size > old_size {
            let delta = new_size - old_size;
            if let Some(limit) = limit {
                let projected = add(global, delta);
                if projected > limit {
                    return ResizeOutcome::NeedsBytes(projected - limit);
                }
            }
            let client_usage = origin.client_usages.get(client).unwrap_or(0);
            origin.client_usages.set(client, Some(add(client_usage, delta)));
            origin.usage = add(origin.usage, delta);
            if let Some(entry) = origin.quota_objects.get_mut(path) {
                entry.size = new_size;
            }
            let group = state
                .groups
                .get_mut(&metadata.group)
                .and_then(|pair| pair.get_mut(metadata.persistence_type))
                .unwrap_or_else(|| fatal_invariant("origin without owning group"));
            group.usage = add(group.usage, delta);
            state.temporary_storage_usage = add(state.temporary_storage_usage, delta);
        } else if new_size < old_size {
            let delta = old_size - new_size;
            let client_usage = origin.client_usages.get(client).unwrap_or(0);
            origin.client_usages.set(client, Some(sub(client_usage, delta)));
            origin.usage = sub(origin.usage, delta);
            if let Some(entry) = origin.quota_objects.get_mut(path) {
                entry.size = new_size;
            }
            let group = state
                .groups
                .get_mut(&metadata.group)
                .and_then(|pair| pair.get_mut(metadata.persistence_type))
                .unwrap_or_else(|| fatal_invariant("origin without owning group"));
            group.usage = sub(group.usage, delta);
            state.temporary_storage_usage = sub(state.temporary_storage_usage, delta);
        }
        ResizeOutcome::Applied
    }

    fn release_quota_object(&self, metadata: &OriginMetadata, path: &PathBuf) {
        let mut state = self.inner.lock();
        if let Some(origin) =
            state.origin_mut(metadata.persistence_type, &metadata.group, &metadata.origin)
            && let Some(entry) = origin.quota_objects.get_mut(path)
        {
            entry.refs -= 1;
            if entry.refs == 0 {
                origin.quota_objects.remove(path);
            }
        }
    }
}

/// Hook the tracker uses to request synchronous space reclamation when
/// a write would push the pool over its limit. Implemented by the
/// engine facade; callers never invoke it with the tracker lock held.
pub trait EvictionGate: Send + Sync {
    /// Try to free at least `min_bytes`; returns the bytes actually
    /// freed (0 when nothing could be evicted).
    fn try_free_space(&self, min_bytes: u64) -> u64;
}

/// Gate that never frees anything. Used before the engine is fully
/// wired and in tests.
pub struct NoEvictionGate;

impl EvictionGate for NoEvictionGate {
    fn try_free_space(&self, _min_bytes: u64) -> u64 {
        0
    }
}

struct QuotaObjectShared {
    tracker: Arc<UsageTracker>,
    gate: Arc<dyn EvictionGate>,
    metadata: OriginMetadata,
    client: ClientType,
    path: PathBuf,
}

impl Drop for QuotaObjectShared {
    fn drop(&mut self) {
        self.tracker.release_quota_object(&self.metadata, &self.path);
    }
}

/// Refcounted per-file size handle. Resizing it atomically adjusts the
/// owning origin's usage and the global usage counter under the shared
/// lock.
#[derive(Clone)]
pub struct QuotaObject {
    shared: Arc<QuotaObjectShared>,
}

impl QuotaObject {
    /// Record a new size for the backing file. Returns `false` when the
    /// growth was denied because the pool is over its limit and nothing
    /// could be evicted.
    #[must_use]
    pub fn update_size(&self, new_size: u64) -> bool {
        let s = &self.shared;
        let mut tried_eviction = false;
        loop {
            match s.tracker.resize_quota_object(&s.metadata, s.client, &s.path, new_size) {
                ResizeOutcome::Applied => return true,
                ResizeOutcome::Gone => return false,
                ResizeOutcome::NeedsBytes(needed) => {
                    if tried_eviction {
                        return false;
                    }
                    // The gate deletes directories and notifies clients;
                    // it must run outside the tracker lock.
                    if s.gate.try_free_space(needed) == 0 {
                        return false;
                    }
                    tried_eviction = true;
                }
            }
        }
    }

    /// Path of the tracked file.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.shared.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotastore_common::now_micros;

    fn full(origin: &str, persistence_type: PersistenceType) -> FullOriginMetadata {
        FullOriginMetadata {
            metadata: OriginMetadata::new(origin, persistence_type),
            persisted: false,
            last_access_time: now_micros(),
        }
    }

    fn usages(kv: u64, cache: u64) -> ClientUsageArray {
        let mut array = ClientUsageArray::default();
        array.set(ClientType::KeyValue, Some(kv));
        array.set(ClientType::Cache, Some(cache));
        array
    }

    /// Recompute the global counter independently and compare.
    fn assert_counter_consistent(tracker: &UsageTracker) {
        let recomputed = tracker.with_state(|state| {
            state
                .groups
                .values()
                .flat_map(|pair| pair.iter())
                .flat_map(|(_, group)| group.origins.values())
                .map(|origin| origin.client_usages.total())
                .sum::<u64>()
        });
        assert_eq!(tracker.total_usage(), recomputed);
    }

    #[test]
    fn test_init_and_sum() {
        let tracker = UsageTracker::new();
        tracker.init_origin(
            &full("https://a.example.com", PersistenceType::Default),
            usages(100, 50),
            false,
            true,
        );
        tracker.init_origin(
            &full("https://b.example.com", PersistenceType::Temporary),
            usages(10, 0),
            false,
            true,
        );

        assert_eq!(tracker.total_usage(), 160);
        assert_eq!(tracker.group_usage("example.com"), 160);
        assert_eq!(
            tracker.origin_usage(&OriginMetadata::new(
                "https://a.example.com",
                PersistenceType::Default
            )),
            150
        );
        assert_counter_consistent(&tracker);
    }

    #[test]
    fn test_persistent_bypasses_tracking() {
        let tracker = UsageTracker::new();
        tracker.init_origin(
            &full("https://a.example.com", PersistenceType::Persistent),
            usages(1000, 0),
            false,
            true,
        );
        assert_eq!(tracker.total_usage(), 0);
        assert!(!tracker.has_origin(&OriginMetadata::new(
            "https://a.example.com",
            PersistenceType::Persistent
        )));
    }

    #[test]
    fn test_client_usage_deltas() {
        let tracker = UsageTracker::new();
        let meta = OriginMetadata::new("https://a.example.com", PersistenceType::Default);
        tracker.init_origin(&full("https://a.example.com", PersistenceType::Default), usages(100, 0), false, true);

        tracker.increase_usage_for_client(&meta, ClientType::KeyValue, 25);
        assert_eq!(tracker.client_usage(&meta, ClientType::KeyValue), Some(125));
        assert_eq!(tracker.total_usage(), 125);

        tracker.decrease_usage_for_client(&meta, ClientType::KeyValue, 5);
        assert_eq!(tracker.client_usage(&meta, ClientType::KeyValue), Some(120));
        assert_eq!(tracker.group_usage("example.com"), 120);
        assert_counter_consistent(&tracker);
    }

    #[test]
    fn test_remove_origin_releases_usage() {
        let tracker = UsageTracker::new();
        let meta = OriginMetadata::new("https://a.example.com", PersistenceType::Default);
        tracker.init_origin(&full("https://a.example.com", PersistenceType::Default), usages(100, 20), false, true);

        let freed = tracker.remove_origin(&meta);
        assert_eq!(freed, 120);
        assert_eq!(tracker.total_usage(), 0);
        assert_eq!(tracker.group_usage("example.com"), 0);
        assert!(!tracker.has_origin(&meta));
        // Empty group records are discarded entirely.
        tracker.with_state(|state| assert!(state.groups.is_empty()));
    }

    #[test]
    fn test_remove_repository() {
        let tracker = UsageTracker::new();
        tracker.init_origin(&full("https://a.example.com", PersistenceType::Default), usages(100, 0), false, true);
        tracker.init_origin(&full("https://a.example.com", PersistenceType::Temporary), usages(7, 0), false, true);

        tracker.remove_repository(PersistenceType::Temporary);
        assert_eq!(tracker.total_usage(), 100);
        assert_counter_consistent(&tracker);
    }

    #[test]
    fn test_reinit_replaces_measurement() {
        let tracker = UsageTracker::new();
        tracker.init_origin(&full("https://a.example.com", PersistenceType::Default), usages(100, 0), false, true);
        tracker.init_origin(&full("https://a.example.com", PersistenceType::Default), usages(40, 2), false, true);

        assert_eq!(tracker.total_usage(), 42);
        assert_counter_consistent(&tracker);
    }

    #[test]
    fn test_quota_object_adjusts_usage() {
        let tracker = Arc::new(UsageTracker::new());
        tracker.set_limit(1000);
        let meta = OriginMetadata::new("https://a.example.com", PersistenceType::Default);
        tracker.init_origin(&full("https://a.example.com", PersistenceType::Default), usages(100, 0), false, true);

        let qo = tracker
            .get_quota_object(
                &meta,
                ClientType::KeyValue,
                PathBuf::from("/x/data.bin"),
                40,
                Arc::new(NoEvictionGate),
            )
            .unwrap();

        assert!(qo.update_size(90));
        assert_eq!(tracker.client_usage(&meta, ClientType::KeyValue), Some(150));
        assert_eq!(tracker.total_usage(), 150);

        assert!(qo.update_size(10));
        assert_eq!(tracker.total_usage(), 70);
        assert_counter_consistent(&tracker);
    }

    #[test]
    fn test_quota_object_denied_over_limit() {
        let tracker = Arc::new(UsageTracker::new());
        tracker.set_limit(120);
        let meta = OriginMetadata::new("https://a.example.com", PersistenceType::Default);
        tracker.init_origin(&full("https://a.example.com", PersistenceType::Default), usages(100, 0), false, true);

        let qo = tracker
            .get_quota_object(
                &meta,
                ClientType::KeyValue,
                PathBuf::from("/x/data.bin"),
                0,
                Arc::new(NoEvictionGate),
            )
            .unwrap();

        // 100 tracked + 30 growth > 120 and the gate frees nothing.
        assert!(!qo.update_size(30));
        assert_eq!(tracker.total_usage(), 100);

        // Within the limit it applies.
        assert!(qo.update_size(20));
        assert_eq!(tracker.total_usage(), 120);
    }

    #[test]
    fn test_quota_object_none_for_persistent() {
        let tracker = Arc::new(UsageTracker::new());
        let meta = OriginMetadata::new("https://a.example.com", PersistenceType::Persistent);
        assert!(
            tracker
                .get_quota_object(
                    &meta,
                    ClientType::KeyValue,
                    PathBuf::from("/x"),
                    0,
                    Arc::new(NoEvictionGate)
                )
                .is_none()
        );
    }

    #[test]
    fn test_persisted_flag() {
        let tracker = UsageTracker::new();
        let meta = OriginMetadata::new("https://a.example.com", PersistenceType::Default);
        tracker.init_origin(&full("https://a.example.com", PersistenceType::Default), usages(1, 0), false, true);

        assert!(!tracker.origin_persisted(&meta));
        tracker.set_origin_persisted(&meta, true);
        assert!(tracker.origin_persisted(&meta));
    }

    #[test]
    fn test_snapshot_rows() {
        let tracker = UsageTracker::new();
        tracker.init_origin(&full("https://a.example.com", PersistenceType::Default), usages(100, 50), true, true);
        let mut no_dir = full("https://b.example.com", PersistenceType::Default);
        no_dir.last_access_time = 7;
        tracker.init_origin(&no_dir, usages(5, 0), false, false);

        let rows = tracker.snapshot_rows();
        assert_eq!(rows.len(), 1);
        let (persistence_type, row) = &rows[0];
        assert_eq!(*persistence_type, PersistenceType::Default);
        assert_eq!(row.origin, "https://a.example.com");
        assert_eq!(row.usage, 150);
        assert!(row.accessed);
        assert_eq!(
            ClientUsageArray::deserialize(&row.client_usages).unwrap(),
            usages(100, 50)
        );
    }

    #[test]
    fn test_usage_and_limit_for_estimate() {
        let tracker = UsageTracker::new();
        tracker.set_limit(1000);
        let meta = OriginMetadata::new("https://a.example.com", PersistenceType::Default);
        tracker.init_origin(&full("https://a.example.com", PersistenceType::Default), usages(100, 0), false, true);

        let (usage, limit) = tracker.usage_and_limit_for_estimate(&meta, 200);
        assert_eq!((usage, limit), (100, 200));

        tracker.set_origin_persisted(&meta, true);
        let (usage, limit) = tracker.usage_and_limit_for_estimate(&meta, 200);
        assert_eq!((usage, limit), (100, 1000));
    }
}
