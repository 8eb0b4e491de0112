//! LRU eviction candidate selection
//!
//! Scans the usage tree for groups (and the whole best-effort pool)
//! exceeding their limits and selects least-recently-used origins to
//! delete. Origins flagged persisted are never selected; neither is
//! default/private-persistence data of extension-style principals, nor
//! any origin overlapped by a currently acquired directory lock.
//!
//! Selection happens on the owning thread under the tracker lock;
//! deletion happens later on the IO thread. The tie-break among origins
//! with identical access times is the stable traversal order of the
//! underlying maps and is not a guaranteed property.

use crate::locks::LockScope;
use crate::tracker::{OriginInfo, UsageTracker};
use quotastore_common::{FullOriginMetadata, PersistenceType};

/// One origin chosen for eviction.
#[derive(Clone, Debug)]
pub struct EvictionCandidate {
    pub metadata: FullOriginMetadata,
    pub usage: u64,
}

impl EvictionCandidate {
    fn from_origin(origin: &OriginInfo) -> Self {
        Self {
            metadata: origin.full_metadata(),
            usage: origin.usage,
        }
    }
}

fn is_extension_origin(origin: &OriginInfo, extension_schemes: &[String]) -> bool {
    extension_schemes
        .iter()
        .any(|scheme| origin.metadata.origin.starts_with(scheme.as_str()))
}

fn is_locked(
    locked: &[LockScope],
    persistence_type: PersistenceType,
    origin: &str,
) -> bool {
    locked
        .iter()
        .any(|scope| scope.covers_origin(persistence_type, origin))
}

/// Whether an origin may ever be selected for eviction.
fn is_evictable(
    origin: &OriginInfo,
    persistence_type: PersistenceType,
    extension_schemes: &[String],
    locked: &[LockScope],
) -> bool {
    if origin.persisted {
        return false;
    }
    // Extension data outside the temporary repository has no server-side
    // copy; evicting it would lose it for good.
    if persistence_type != PersistenceType::Temporary
        && is_extension_origin(origin, extension_schemes)
    {
        return false;
    }
    !is_locked(locked, persistence_type, &origin.metadata.origin)
}

impl UsageTracker {
    /// For every group over the group limit: its evictable origins in
    /// ascending access-time order, truncated once removing them brings
    /// the group at or under the limit.
    pub(crate) fn origins_exceeding_group_limit(
        &self,
        group_limit: u64,
        extension_schemes: &[String],
        locked: &[LockScope],
    ) -> Vec<Vec<EvictionCandidate>> {
        self.with_state(|state| {
            let mut result = Vec::new();
            for pair in state.groups.values() {
                let mut group_usage = pair.usage();
                if group_usage == 0 || group_usage <= group_limit {
                    continue;
                }

                let mut eligible: Vec<(PersistenceType, &OriginInfo)> = pair
                    .iter()
                    .flat_map(|(persistence_type, group)| {
                        group
                            .origins
                            .values()
                            .map(move |origin| (persistence_type, origin))
                    })
                    .filter(|(persistence_type, origin)| {
                        is_evictable(origin, *persistence_type, extension_schemes, locked)
                    })
                    .collect();
                eligible.sort_by_key(|(_, origin)| origin.last_access_time);

                let mut selected = Vec::new();
                for (_, origin) in eligible {
                    selected.push(EvictionCandidate::from_origin(origin));
                    group_usage = group_usage.saturating_sub(origin.usage);
                    if group_usage <= group_limit {
                        break;
                    }
                }
                if !selected.is_empty() {
                    result.push(selected);
                }
            }
            result
        })
    }

    /// Evictable origins across the whole best-effort pool, in
    /// ascending access-time order, truncated once the pool fits its
    /// global limit again.
    pub(crate) fn origins_exceeding_global_limit(
        &self,
        extension_schemes: &[String],
        locked: &[LockScope],
    ) -> Vec<EvictionCandidate> {
        self.with_state(|state| {
            let Some(limit) = state.temporary_storage_limit else {
                return Vec::new();
            };
            if state.temporary_storage_usage <= limit {
                return Vec::new();
            }

            let mut eligible: Vec<(PersistenceType, &OriginInfo)> = state
                .groups
                .values()
                .flat_map(|pair| {
                    pair.iter().flat_map(|(persistence_type, group)| {
                        group
                            .origins
                            .values()
                            .map(move |origin| (persistence_type, origin))
                    })
                })
                .filter(|(persistence_type, origin)| {
                    is_evictable(origin, *persistence_type, extension_schemes, locked)
                })
                .collect();
            eligible.sort_by_key(|(_, origin)| origin.last_access_time);

            let mut doomed = 0u64;
            let mut selected = Vec::new();
            for (_, origin) in eligible {
                if state.temporary_storage_usage - doomed <= limit {
                    break;
                }
                doomed += origin.usage;
                selected.push(EvictionCandidate::from_origin(origin));
            }
            selected
        })
    }

    /// Synchronous-pressure selection: inactive (unlocked, no open
    /// files) origins across all best-effort types in ascending
    /// access-time order, accumulated until at least `min_bytes` would
    /// be freed. Returns nothing when the target cannot be met.
    pub(crate) fn collect_inactive_lru(
        &self,
        min_bytes: u64,
        extension_schemes: &[String],
        locked: &[LockScope],
    ) -> (Vec<EvictionCandidate>, u64) {
        self.with_state(|state| {
            let mut eligible: Vec<(PersistenceType, &OriginInfo)> = state
                .groups
                .values()
                .flat_map(|pair| {
                    pair.iter().flat_map(|(persistence_type, group)| {
                        group
                            .origins
                            .values()
                            .map(move |origin| (persistence_type, origin))
                    })
                })
                .filter(|(persistence_type, origin)| {
                    // An inactive origin cannot have open files; a live
                    // quota object implies an overlapping client lock.
                    origin.quota_objects.is_empty()
                        && is_evictable(origin, *persistence_type, extension_schemes, locked)
                })
                .collect();
            eligible.sort_by_key(|(_, origin)| origin.last_access_time);

            let mut freed = 0u64;
            let mut selected = Vec::new();
            for (_, origin) in eligible {
                if freed >= min_bytes {
                    break;
                }
                freed += origin.usage;
                selected.push(EvictionCandidate::from_origin(origin));
            }

            if freed >= min_bytes {
                (selected, freed)
            } else {
                (Vec::new(), 0)
            }
        })
    }
}
