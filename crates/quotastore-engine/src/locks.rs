//! Scoped directory locks
//!
//! A directory lock is a request over (persistence type?, origin scope,
//! client type?, exclusive). A null field matches anything. Two locks
//! conflict when their scopes intersect and at least one side is
//! exclusive.
//!
//! On registration a lock records every earlier-registered lock it
//! conflicts with as a blocker and resolves only once all blockers have
//! dropped, preserving registration order: a later lock never blocks an
//! earlier one, and concurrent shared requests over the same scope
//! never block each other. On shutdown all still-pending locks are
//! rejected rather than granted.
//!
//! The registry lives on the owning thread; handles release themselves
//! through a dropper callback that routes back to that thread.

use quotastore_common::{ClientType, OriginScope, PersistenceType, Result};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Monotonic lock identifier; ids double as registration order.
pub type LockId = i64;

/// Diagnostic tag describing why a lock exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockCategory {
    #[default]
    None,
    /// Storage (re)initialization.
    Initialization,
    /// Quota-pressure eviction quarantine.
    Eviction,
    /// Clear/reset operations.
    Clearing,
    /// Engine shutdown.
    Shutdown,
}

/// The region of the storage tree a lock covers.
#[derive(Clone, Debug)]
pub struct LockScope {
    /// `None` covers every repository.
    pub persistence_type: Option<PersistenceType>,
    pub origin_scope: OriginScope,
    /// `None` covers every client directory.
    pub client_type: Option<ClientType>,
}

impl LockScope {
    /// Scope over the entire storage tree.
    #[must_use]
    pub const fn universal() -> Self {
        Self {
            persistence_type: None,
            origin_scope: OriginScope::Null,
            client_type: None,
        }
    }

    /// Scope over one origin directory.
    #[must_use]
    pub const fn origin(persistence_type: PersistenceType, origin: String) -> Self {
        Self {
            persistence_type: Some(persistence_type),
            origin_scope: OriginScope::Origin(origin),
            client_type: None,
        }
    }

    /// Scope over one client directory inside an origin directory.
    #[must_use]
    pub const fn client(
        persistence_type: PersistenceType,
        origin: String,
        client_type: ClientType,
    ) -> Self {
        Self {
            persistence_type: Some(persistence_type),
            origin_scope: OriginScope::Origin(origin),
            client_type: Some(client_type),
        }
    }

    /// Scope intersection; a null field matches anything.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let persistence = match (self.persistence_type, other.persistence_type) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        let client = match (self.client_type, other.client_type) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        persistence && client && self.origin_scope.overlaps(&other.origin_scope)
    }

    /// Whether a concrete (persistence type, origin) pair falls inside
    /// this scope.
    #[must_use]
    pub fn covers_origin(&self, persistence_type: PersistenceType, origin: &str) -> bool {
        self.persistence_type.is_none_or(|t| t == persistence_type)
            && self.origin_scope.matches_origin(origin)
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let persistence = self
            .persistence_type
            .map_or_else(|| "*".to_string(), |t| t.to_string());
        let origin = match &self.origin_scope {
            OriginScope::Origin(o) => o.clone(),
            OriginScope::Prefix(p) => format!("{p}^*"),
            OriginScope::Pattern(_) => "<pattern>".to_string(),
            OriginScope::Null => "*".to_string(),
        };
        let client = self
            .client_type
            .map_or_else(|| "*".to_string(), |c| c.to_string());
        write!(f, "{persistence}/{origin}/{client}")
    }
}

/// Callback a granted handle uses to release itself on the owning
/// thread.
pub(crate) type LockDropper = Arc<dyn Fn(LockId) + Send + Sync>;

/// Granted directory lock. Dropping the handle releases the region.
pub struct DirectoryLock {
    id: LockId,
    scope: LockScope,
    exclusive: bool,
    category: LockCategory,
    dropper: LockDropper,
}

impl DirectoryLock {
    #[must_use]
    pub fn id(&self) -> LockId {
        self.id
    }

    #[must_use]
    pub fn scope(&self) -> &LockScope {
        &self.scope
    }

    #[must_use]
    pub fn exclusive(&self) -> bool {
        self.exclusive
    }

    #[must_use]
    pub fn category(&self) -> LockCategory {
        self.category
    }
}

impl fmt::Debug for DirectoryLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryLock")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("exclusive", &self.exclusive)
            .finish_non_exhaustive()
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        (self.dropper)(self.id);
    }
}

/// What to do once a pending lock resolves.
pub(crate) enum LockWaiter {
    /// Complete a caller-visible future.
    External(oneshot::Sender<Result<DirectoryLock>>),
    /// Run an owner-thread continuation.
    Internal(Box<dyn FnOnce(Result<DirectoryLock>) + Send>),
}

impl LockWaiter {
    pub(crate) fn complete(self, result: Result<DirectoryLock>) {
        match self {
            Self::External(tx) => {
                // The caller may have gone away; the returned handle
                // drops here and releases itself.
                let _ = tx.send(result);
            }
            Self::Internal(f) => f(result),
        }
    }
}

struct LockEntry {
    scope: LockScope,
    exclusive: bool,
    category: LockCategory,
    /// Empty for acquired locks.
    blocked_by: HashSet<LockId>,
    /// `Some` while pending.
    waiter: Option<LockWaiter>,
}

impl LockEntry {
    fn acquired(&self) -> bool {
        self.waiter.is_none()
    }
}

/// Tracks acquired and pending locks; grants in registration order.
pub(crate) struct LockRegistry {
    next_id: LockId,
    entries: BTreeMap<LockId, LockEntry>,
    dropper: LockDropper,
}

impl LockRegistry {
    pub(crate) fn new(dropper: LockDropper) -> Self {
        Self {
            next_id: 0,
            entries: BTreeMap::new(),
            dropper,
        }
    }

    fn handle(&self, id: LockId, entry: &LockEntry) -> DirectoryLock {
        DirectoryLock {
            id,
            scope: entry.scope.clone(),
            exclusive: entry.exclusive,
            category: entry.category,
            dropper: Arc::clone(&self.dropper),
        }
    }

    /// Register a lock and either grant it immediately (no blockers) or
    /// park the waiter until every blocker has dropped.
    pub(crate) fn create_and_acquire(
        &mut self,
        scope: LockScope,
        exclusive: bool,
        category: LockCategory,
        waiter: LockWaiter,
    ) {
        let id = self.next_id;
        self.next_id += 1;

        // A lock only ever waits on locks registered before it; a later
        // lock can never block an earlier one.
        let blocked_by: HashSet<LockId> = self
            .entries
            .iter()
            .filter(|(_, other)| {
                (exclusive || other.exclusive) && scope.overlaps(&other.scope)
            })
            .map(|(other_id, _)| *other_id)
            .collect();

        debug!(id, %scope, exclusive, blockers = blocked_by.len(), "directory lock registered");

        let mut entry = LockEntry {
            scope,
            exclusive,
            category,
            blocked_by,
            waiter: Some(waiter),
        };

        if entry.blocked_by.is_empty() {
            let waiter = entry.waiter.take().unwrap_or_else(|| unreachable!());
            let handle = self.handle(id, &entry);
            self.entries.insert(id, entry);
            waiter.complete(Ok(handle));
        } else {
            self.entries.insert(id, entry);
        }
    }

    /// Register and grant a lock that is known to have no blockers
    /// (eviction quarantine over inactive origins). A blocker here is a
    /// lock-state impossibility.
    pub(crate) fn acquire_immediately(
        &mut self,
        scope: LockScope,
        exclusive: bool,
        category: LockCategory,
    ) -> DirectoryLock {
        let conflicting = self
            .entries
            .values()
            .any(|other| (exclusive || other.exclusive) && scope.overlaps(&other.scope));
        if conflicting {
            quotastore_common::error::fatal_invariant(
                "immediate lock acquisition found an overlapping lock",
            );
        }

        let id = self.next_id;
        self.next_id += 1;
        let entry = LockEntry {
            scope,
            exclusive,
            category,
            blocked_by: HashSet::new(),
            waiter: None,
        };
        let handle = self.handle(id, &entry);
        self.entries.insert(id, entry);
        handle
    }

    /// Drop a lock and resolve any pending locks it was blocking, in
    /// registration order.
    pub(crate) fn release(&mut self, id: LockId) {
        if self.entries.remove(&id).is_none() {
            return;
        }

        let mut granted: Vec<(LockId, LockWaiter)> = Vec::new();
        for (pending_id, entry) in &mut self.entries {
            if entry.acquired() {
                continue;
            }
            entry.blocked_by.remove(&id);
            if entry.blocked_by.is_empty() {
                if let Some(waiter) = entry.waiter.take() {
                    granted.push((*pending_id, waiter));
                }
            }
        }

        for (granted_id, waiter) in granted {
            let handle = self
                .entries
                .get(&granted_id)
                .map(|entry| self.handle(granted_id, entry));
            match handle {
                Some(handle) => {
                    debug!(id = granted_id, "directory lock granted");
                    waiter.complete(Ok(handle));
                }
                None => waiter.complete(Err(quotastore_common::Error::ShutdownAborted)),
            }
        }
    }

    /// Reject every still-pending lock. Acquired locks stay registered
    /// until their handles drop.
    pub(crate) fn invalidate_pending(&mut self) {
        let pending: Vec<LockId> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.acquired())
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            if let Some(mut entry) = self.entries.remove(&id) {
                debug!(id, "invalidating pending directory lock");
                if let Some(waiter) = entry.waiter.take() {
                    waiter.complete(Err(quotastore_common::Error::ShutdownAborted));
                }
            }
        }
    }

    /// Snapshot of currently acquired lock scopes (for eviction's
    /// active-origin filtering).
    pub(crate) fn acquired_scopes(&self) -> Vec<LockScope> {
        self.entries
            .values()
            .filter(|entry| entry.acquired())
            .map(|entry| entry.scope.clone())
            .collect()
    }

    /// Snapshot of every registered lock scope, pending ones included.
    /// Eviction quarantine must not touch an origin a pending request
    /// already covers, or its immediate acquisition would conflict.
    pub(crate) fn registered_scopes(&self) -> Vec<LockScope> {
        self.entries
            .values()
            .map(|entry| entry.scope.clone())
            .collect()
    }

    /// Scopes of acquired locks that overlap the given scope (reported
    /// to clients so they can abort work blocking an exclusive request).
    pub(crate) fn blocking_scopes(&self, scope: &LockScope, exclusive: bool) -> Vec<LockScope> {
        self.entries
            .values()
            .filter(|entry| {
                entry.acquired()
                    && (exclusive || entry.exclusive)
                    && scope.overlaps(&entry.scope)
            })
            .map(|entry| entry.scope.clone())
            .collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn registry() -> (LockRegistry, Arc<Mutex<Vec<LockId>>>) {
        let released = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&released);
        let registry = LockRegistry::new(Arc::new(move |id| sink.lock().push(id)));
        (registry, released)
    }

    fn acquire(
        registry: &mut LockRegistry,
        scope: LockScope,
        exclusive: bool,
    ) -> oneshot::Receiver<Result<DirectoryLock>> {
        let (tx, rx) = oneshot::channel();
        registry.create_and_acquire(scope, exclusive, LockCategory::None, LockWaiter::External(tx));
        rx
    }

    fn granted(rx: &mut oneshot::Receiver<Result<DirectoryLock>>) -> Option<DirectoryLock> {
        rx.try_recv().ok().and_then(|result| result.ok())
    }

    fn origin_scope(origin: &str) -> LockScope {
        LockScope::origin(PersistenceType::Default, origin.to_string())
    }

    #[test]
    fn test_shared_locks_do_not_block() {
        let (mut registry, _) = registry();
        let mut a = acquire(&mut registry, origin_scope("https://a.com"), false);
        let mut b = acquire(&mut registry, origin_scope("https://a.com"), false);

        assert!(granted(&mut a).is_some());
        assert!(granted(&mut b).is_some());
    }

    #[test]
    fn test_exclusive_blocks_and_resolves_in_order() {
        let (mut registry, released) = registry();

        let mut a = acquire(&mut registry, origin_scope("https://a.com"), false);
        let mut b = acquire(&mut registry, origin_scope("https://a.com"), false);
        let lock_a = granted(&mut a).unwrap();
        let lock_b = granted(&mut b).unwrap();

        // Exclusive over the same origin waits for both shared locks.
        let mut c = acquire(&mut registry, origin_scope("https://a.com"), true);
        assert!(granted(&mut c).is_none());

        // A later shared request must not jump the queue past the
        // pending exclusive one.
        let mut d = acquire(&mut registry, origin_scope("https://a.com"), false);
        assert!(granted(&mut d).is_none());

        drop(lock_a);
        drop(lock_b);
        for id in released.lock().drain(..) {
            registry.release(id);
        }
        let lock_c = granted(&mut c).unwrap();
        assert!(granted(&mut d).is_none());

        drop(lock_c);
        for id in released.lock().drain(..) {
            registry.release(id);
        }
        assert!(granted(&mut d).is_some());
    }

    #[test]
    fn test_disjoint_scopes_do_not_block() {
        let (mut registry, _) = registry();
        let mut a = acquire(&mut registry, origin_scope("https://a.com"), true);
        let mut b = acquire(&mut registry, origin_scope("https://b.com"), true);
        assert!(granted(&mut a).is_some());
        assert!(granted(&mut b).is_some());
    }

    #[test]
    fn test_null_fields_match_anything() {
        let (mut registry, _) = registry();
        let mut universal = acquire(&mut registry, LockScope::universal(), true);
        assert!(granted(&mut universal).is_some());

        let mut client = acquire(
            &mut registry,
            LockScope::client(
                PersistenceType::Temporary,
                "https://a.com".to_string(),
                ClientType::Cache,
            ),
            false,
        );
        assert!(granted(&mut client).is_none());
    }

    #[test]
    fn test_client_disjointness() {
        let (mut registry, _) = registry();
        let mut kv = acquire(
            &mut registry,
            LockScope::client(
                PersistenceType::Default,
                "https://a.com".to_string(),
                ClientType::KeyValue,
            ),
            true,
        );
        let mut cache = acquire(
            &mut registry,
            LockScope::client(
                PersistenceType::Default,
                "https://a.com".to_string(),
                ClientType::Cache,
            ),
            true,
        );
        assert!(granted(&mut kv).is_some());
        assert!(granted(&mut cache).is_some());
    }

    #[test]
    fn test_invalidate_pending_rejects_with_shutdown() {
        let (mut registry, _) = registry();
        let mut a = acquire(&mut registry, origin_scope("https://a.com"), true);
        let _lock_a = granted(&mut a).unwrap();

        let mut b = acquire(&mut registry, origin_scope("https://a.com"), true);
        registry.invalidate_pending();

        let err = b.try_recv().unwrap().unwrap_err();
        assert!(err.is_shutdown());
        // The acquired lock is untouched.
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_acquire_immediately() {
        let (mut registry, released) = registry();
        let lock = registry.acquire_immediately(
            origin_scope("https://a.com"),
            true,
            LockCategory::Eviction,
        );
        assert_eq!(lock.category(), LockCategory::Eviction);

        let mut blocked = acquire(&mut registry, origin_scope("https://a.com"), false);
        assert!(granted(&mut blocked).is_none());

        drop(lock);
        for id in released.lock().drain(..) {
            registry.release(id);
        }
        assert!(granted(&mut blocked).is_some());
    }

    #[test]
    fn test_blocking_scopes() {
        let (mut registry, _) = registry();
        let mut a = acquire(&mut registry, origin_scope("https://a.com"), false);
        let _lock = granted(&mut a).unwrap();

        let blockers = registry.blocking_scopes(&LockScope::universal(), true);
        assert_eq!(blockers.len(), 1);
        assert!(blockers[0].covers_origin(PersistenceType::Default, "https://a.com"));
    }
}
