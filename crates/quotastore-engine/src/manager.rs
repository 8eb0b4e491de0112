//! Quota manager facade
//!
//! One explicit engine instance composes the tracker, lock registry,
//! eviction engine and initializer. A dedicated owning thread sequences
//! every lock grant, state transition and promise resolution; the
//! public async surface submits commands to it and resolves oneshot
//! futures. Filesystem and database work is forwarded to the serial IO
//! thread and results cross back as owner-thread continuations.
//!
//! Shutdown is a bounded state machine with exactly two escalating
//! watchdog timers: a force-kill timer that aborts remaining client
//! actors, and a fatal timer that terminates the process rather than
//! accept a silent incomplete shutdown.

use crate::client::Clients;
use crate::eviction::EvictionCandidate;
use crate::initializer::{self, StorageInitState};
use crate::io::{self, IoContext, IoMessage, IoThread};
use crate::locks::{
    DirectoryLock, LockCategory, LockDropper, LockId, LockRegistry, LockScope, LockWaiter,
};
use crate::tracker::{EvictionGate, QuotaObject, UsageTracker};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use quotastore_common::{
    ClientType, Error, OriginAttributesPattern, OriginMetadata, OriginScope, PersistenceType,
    QuotaConfig, Result, config::group_limit, now_micros,
};
use quotastore_db::StorageLayout;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

type ReplySender<T> = oneshot::Sender<Result<T>>;
type OwnerFn = Box<dyn FnOnce(&mut OwnerState) + Send>;

/// What a clear-family operation targets.
pub(crate) enum ClearTarget {
    Origin {
        persistence_type: Option<PersistenceType>,
        metadata: OriginMetadata,
        client_type: Option<ClientType>,
    },
    Prefix {
        origin: String,
    },
    Pattern {
        pattern: OriginAttributesPattern,
    },
    PrivateRepository,
    All,
    /// Close the storage connection (writes the usage cache, keeps
    /// files).
    ShutdownStorage,
}

pub(crate) enum OwnerMessage {
    InitializeStorage { reply: ReplySender<()> },
    InitializeTemporaryStorage { reply: ReplySender<()> },
    OpenDirectory {
        scope: LockScope,
        exclusive: bool,
        category: LockCategory,
        reply: ReplySender<DirectoryLock>,
    },
    OpenClientDirectory {
        metadata: OriginMetadata,
        client_type: ClientType,
        reply: ReplySender<DirectoryLock>,
    },
    Clear { target: ClearTarget, reply: ReplySender<()> },
    PersistOrigin { metadata: OriginMetadata, reply: ReplySender<()> },
    OriginPersisted { metadata: OriginMetadata, reply: ReplySender<bool> },
    GetOriginUsage { metadata: OriginMetadata, reply: ReplySender<u64> },
    GetUsageForClient {
        metadata: OriginMetadata,
        client_type: ClientType,
        reply: ReplySender<Option<u64>>,
    },
    GetInitState { reply: oneshot::Sender<StorageInitState> },
    CollectEviction {
        min_bytes: u64,
        rendezvous: RendezvousSender<(Vec<EvictionCandidate>, Vec<DirectoryLock>, u64)>,
    },
    ReleaseLock(LockId),
    RunOnOwner(OwnerFn),
    Stop,
}

/// Single condition-variable rendezvous used for cross-thread waits.
/// The sending half fills a default value when dropped unfulfilled
/// (message discarded during teardown), so waiters never need their
/// own timeout.
pub(crate) struct Rendezvous<T> {
    inner: Arc<(Mutex<Option<T>>, Condvar)>,
}

pub(crate) struct RendezvousSender<T: Default> {
    inner: Arc<(Mutex<Option<T>>, Condvar)>,
    sent: bool,
}

pub(crate) fn rendezvous<T: Default>() -> (Rendezvous<T>, RendezvousSender<T>) {
    let inner = Arc::new((Mutex::new(None), Condvar::new()));
    (
        Rendezvous {
            inner: Arc::clone(&inner),
        },
        RendezvousSender { inner, sent: false },
    )
}

impl<T> Rendezvous<T> {
    pub(crate) fn wait(&self) -> T {
        let (slot, cvar) = &*self.inner;
        let mut guard = slot.lock();
        while guard.is_none() {
            cvar.wait(&mut guard);
        }
        guard.take().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Default> RendezvousSender<T> {
    pub(crate) fn send(mut self, value: T) {
        let (slot, cvar) = &*self.inner;
        *slot.lock() = Some(value);
        cvar.notify_all();
        self.sent = true;
    }
}

impl<T: Default> Drop for RendezvousSender<T> {
    fn drop(&mut self) {
        if !self.sent {
            let (slot, cvar) = &*self.inner;
            *slot.lock() = Some(T::default());
            cvar.notify_all();
        }
    }
}

/// State owned exclusively by the owning thread.
pub(crate) struct OwnerState {
    registry: LockRegistry,
    init_state: StorageInitState,
    storage_in_flight: bool,
    temp_in_flight: bool,
    storage_waiters: Vec<ReplySender<()>>,
    temp_waiters: Vec<ReplySender<()>>,
    tracker: Arc<UsageTracker>,
    clients: Arc<Clients>,
    config: QuotaConfig,
    shutdown: Arc<AtomicBool>,
    owner_tx: Sender<OwnerMessage>,
    io_tx: Sender<IoMessage>,
}

impl OwnerState {
    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Dispatch an IO job whose result returns as an owner
    /// continuation.
    fn dispatch_io_with_completion<T: Send + 'static>(
        &self,
        job: impl FnOnce(&mut IoContext) -> T + Send + 'static,
        complete: impl FnOnce(&mut Self, T) + Send + 'static,
    ) {
        let owner_tx = self.owner_tx.clone();
        io::dispatch(
            &self.io_tx,
            Box::new(move |ctx| {
                let result = job(ctx);
                let _ = owner_tx.send(OwnerMessage::RunOnOwner(Box::new(move |owner| {
                    complete(owner, result);
                })));
            }),
        );
    }

    fn handle(&mut self, message: OwnerMessage) -> bool {
        match message {
            OwnerMessage::InitializeStorage { reply } => {
                if self.shutting_down() {
                    let _ = reply.send(Err(Error::ShutdownAborted));
                } else if self.init_state >= StorageInitState::CacheValidated {
                    let _ = reply.send(Ok(()));
                } else {
                    self.storage_waiters.push(reply);
                    self.ensure_storage_init();
                }
            }
            OwnerMessage::InitializeTemporaryStorage { reply } => {
                if self.shutting_down() {
                    let _ = reply.send(Err(Error::ShutdownAborted));
                } else if self.init_state == StorageInitState::Ready {
                    let _ = reply.send(Ok(()));
                } else {
                    self.temp_waiters.push(reply);
                    if self.init_state >= StorageInitState::CacheValidated {
                        self.ensure_temp_init();
                    } else {
                        self.ensure_storage_init();
                    }
                }
            }
            OwnerMessage::OpenDirectory {
                scope,
                exclusive,
                category,
                reply,
            } => {
                if self.shutting_down() {
                    let _ = reply.send(Err(Error::ShutdownAborted));
                } else {
                    self.registry.create_and_acquire(
                        scope,
                        exclusive,
                        category,
                        LockWaiter::External(reply),
                    );
                }
            }
            OwnerMessage::OpenClientDirectory {
                metadata,
                client_type,
                reply,
            } => self.handle_open_client_directory(metadata, client_type, reply),
            OwnerMessage::Clear { target, reply } => self.handle_clear(target, reply),
            OwnerMessage::PersistOrigin { metadata, reply } => {
                self.handle_persist_origin(metadata, reply);
            }
            OwnerMessage::OriginPersisted { metadata, reply } => {
                let _ = reply.send(Ok(self.tracker.origin_persisted(&metadata)));
            }
            OwnerMessage::GetOriginUsage { metadata, reply } => {
                if self.shutting_down() {
                    let _ = reply.send(Err(Error::ShutdownAborted));
                } else {
                    self.dispatch_io_with_completion(
                        move |ctx| {
                            let tracked = ctx.tracker.origin_usage(&metadata);
                            initializer::persistent_origin_usage(ctx, &metadata)
                                .map(|persistent| tracked.saturating_add(persistent))
                        },
                        |_, result| {
                            let _ = reply.send(result);
                        },
                    );
                }
            }
            OwnerMessage::GetUsageForClient {
                metadata,
                client_type,
                reply,
            } => {
                if metadata.persistence_type == PersistenceType::Persistent {
                    self.dispatch_io_with_completion(
                        move |ctx| match ctx.clients.get(client_type) {
                            Some(client) => client
                                .init_origin_without_tracking(
                                    PersistenceType::Persistent,
                                    &metadata,
                                    &ctx.shutdown,
                                )
                                .map(|info| info.usage),
                            None => Ok(None),
                        },
                        |_, result| {
                            let _ = reply.send(result);
                        },
                    );
                } else {
                    let _ = reply.send(Ok(self.tracker.client_usage(&metadata, client_type)));
                }
            }
            OwnerMessage::GetInitState { reply } => {
                let _ = reply.send(self.init_state);
            }
            OwnerMessage::CollectEviction {
                min_bytes,
                rendezvous,
            } => {
                let locked = self.registry.registered_scopes();
                let (candidates, size) = self.tracker.collect_inactive_lru(
                    min_bytes,
                    &self.config.storage.extension_schemes,
                    &locked,
                );
                let locks: Vec<DirectoryLock> = candidates
                    .iter()
                    .map(|candidate| {
                        self.registry.acquire_immediately(
                            LockScope::origin(
                                candidate.metadata.metadata.persistence_type,
                                candidate.metadata.metadata.origin.clone(),
                            ),
                            true,
                            LockCategory::Eviction,
                        )
                    })
                    .collect();
                rendezvous.send((candidates, locks, size));
            }
            OwnerMessage::ReleaseLock(id) => self.registry.release(id),
            OwnerMessage::RunOnOwner(f) => f(self),
            OwnerMessage::Stop => {
                self.registry.invalidate_pending();
                return false;
            }
        }
        true
    }

    // ---- Storage / temporary storage initialization ----

    fn ensure_storage_init(&mut self) {
        if self.storage_in_flight {
            return;
        }
        self.storage_in_flight = true;
        self.init_state = StorageInitState::ConnectionOpen;
        self.dispatch_io_with_completion(initializer::init_storage, |owner, result| {
            owner.on_storage_init_done(result);
        });
    }

    fn on_storage_init_done(&mut self, result: Result<()>) {
        self.storage_in_flight = false;
        match result {
            Ok(()) => {
                self.init_state = StorageInitState::CacheValidated;
                for waiter in self.storage_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                if !self.temp_waiters.is_empty() {
                    self.ensure_temp_init();
                }
            }
            Err(e) => {
                self.init_state = StorageInitState::Uninitialized;
                warn!(error = %e, "storage initialization failed");
                for waiter in self.storage_waiters.drain(..) {
                    let _ = waiter.send(Err(e.duplicate()));
                }
                for waiter in self.temp_waiters.drain(..) {
                    let _ = waiter.send(Err(e.duplicate()));
                }
            }
        }
    }

    fn ensure_temp_init(&mut self) {
        if self.temp_in_flight {
            return;
        }
        self.temp_in_flight = true;
        self.dispatch_io_with_completion(initializer::init_temporary_storage, |owner, result| {
            owner.on_temp_init_done(result);
        });
    }

    fn on_temp_init_done(&mut self, result: Result<()>) {
        match result {
            Ok(()) => {
                self.init_state = StorageInitState::TemporaryStorageLoaded;
                self.run_group_limit_cleanup();
            }
            Err(e) => {
                self.temp_in_flight = false;
                warn!(error = %e, "temporary storage initialization failed");
                for waiter in self.temp_waiters.drain(..) {
                    let _ = waiter.send(Err(e.duplicate()));
                }
            }
        }
    }

    /// Evicting origins over their group limit also lowers the global
    /// total, so the two passes run sequentially.
    fn run_group_limit_cleanup(&mut self) {
        let limit = group_limit(self.config.storage.temporary_storage_limit);
        let locked = self.registry.acquired_scopes();
        let candidates: Vec<EvictionCandidate> = self
            .tracker
            .origins_exceeding_group_limit(
                limit,
                &self.config.storage.extension_schemes,
                &locked,
            )
            .into_iter()
            .flatten()
            .collect();
        if candidates.is_empty() {
            self.run_global_limit_cleanup();
            return;
        }
        self.dispatch_io_with_completion(
            move |ctx| initializer::evict_candidates(ctx, &candidates),
            |owner, _freed| owner.run_global_limit_cleanup(),
        );
    }

    fn run_global_limit_cleanup(&mut self) {
        let locked = self.registry.acquired_scopes();
        let candidates = self.tracker.origins_exceeding_global_limit(
            &self.config.storage.extension_schemes,
            &locked,
        );
        if candidates.is_empty() {
            self.finish_temp_init();
            return;
        }
        self.dispatch_io_with_completion(
            move |ctx| initializer::evict_candidates(ctx, &candidates),
            |owner, _freed| owner.finish_temp_init(),
        );
    }

    fn finish_temp_init(&mut self) {
        self.temp_in_flight = false;
        self.init_state = StorageInitState::Ready;
        for waiter in self.temp_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    // ---- Client directory opening ----

    fn handle_open_client_directory(
        &mut self,
        metadata: OriginMetadata,
        client_type: ClientType,
        reply: ReplySender<DirectoryLock>,
    ) {
        if self.shutting_down() {
            let _ = reply.send(Err(Error::ShutdownAborted));
            return;
        }
        let scope = LockScope::client(
            metadata.persistence_type,
            metadata.origin.clone(),
            client_type,
        );
        let io_tx = self.io_tx.clone();
        let owner_tx = self.owner_tx.clone();
        let waiter = LockWaiter::Internal(Box::new(move |result| match result {
            Err(e) => {
                let _ = reply.send(Err(e));
            }
            Ok(lock) => {
                io::dispatch(
                    &io_tx,
                    Box::new(move |ctx| {
                        let result = initializer::ensure_origin_initialized(ctx, &metadata)
                            .and_then(|_| {
                                initializer::save_origin_access_time(
                                    ctx,
                                    &metadata,
                                    now_micros(),
                                )
                            });
                        let _ = owner_tx.send(OwnerMessage::RunOnOwner(Box::new(
                            move |_owner| match result {
                                Ok(()) => {
                                    let _ = reply.send(Ok(lock));
                                }
                                Err(e) => {
                                    drop(lock);
                                    let _ = reply.send(Err(e));
                                }
                            },
                        )));
                    }),
                );
            }
        }));
        self.registry
            .create_and_acquire(scope, false, LockCategory::None, waiter);
    }

    // ---- Clear operations ----

    fn handle_clear(&mut self, target: ClearTarget, reply: ReplySender<()>) {
        // Shutdown's own teardown operations pass through the flag.
        let exempt = matches!(
            target,
            ClearTarget::PrivateRepository | ClearTarget::ShutdownStorage
        );
        if self.shutting_down() && !exempt {
            let _ = reply.send(Err(Error::ShutdownAborted));
            return;
        }

        let (scope, category) = match &target {
            ClearTarget::Origin {
                persistence_type,
                metadata,
                client_type,
            } => (
                LockScope {
                    persistence_type: *persistence_type,
                    origin_scope: OriginScope::Origin(metadata.origin.clone()),
                    client_type: *client_type,
                },
                LockCategory::Clearing,
            ),
            ClearTarget::Prefix { origin } => (
                LockScope {
                    persistence_type: None,
                    origin_scope: OriginScope::Prefix(origin.clone()),
                    client_type: None,
                },
                LockCategory::Clearing,
            ),
            ClearTarget::Pattern { pattern } => (
                LockScope {
                    persistence_type: None,
                    origin_scope: OriginScope::Pattern(pattern.clone()),
                    client_type: None,
                },
                LockCategory::Clearing,
            ),
            ClearTarget::PrivateRepository => (
                LockScope {
                    persistence_type: Some(PersistenceType::Private),
                    origin_scope: OriginScope::Null,
                    client_type: None,
                },
                LockCategory::Clearing,
            ),
            ClearTarget::All => (LockScope::universal(), LockCategory::Clearing),
            ClearTarget::ShutdownStorage => (LockScope::universal(), LockCategory::Shutdown),
        };

        if matches!(target, ClearTarget::ShutdownStorage) {
            // Ask clients to wind down the work that holds the locks
            // this exclusive request is about to wait on.
            let blockers = self.registry.blocking_scopes(&scope, true);
            if !blockers.is_empty() {
                for client in self.clients.iter() {
                    client.abort_operations_for_locks(&blockers);
                }
            }
        }

        let io_tx = self.io_tx.clone();
        let owner_tx = self.owner_tx.clone();
        let waiter = LockWaiter::Internal(Box::new(move |result| match result {
            Err(e) => {
                let _ = reply.send(Err(e));
            }
            Ok(lock) => {
                io::dispatch(
                    &io_tx,
                    Box::new(move |ctx| {
                        let (result, reset_state) = match &target {
                            ClearTarget::Origin {
                                persistence_type,
                                metadata,
                                client_type,
                            } => (
                                initializer::clear_matching_origins(
                                    ctx,
                                    *persistence_type,
                                    &OriginScope::Origin(metadata.origin.clone()),
                                    *client_type,
                                ),
                                false,
                            ),
                            ClearTarget::Prefix { origin } => (
                                initializer::clear_matching_origins(
                                    ctx,
                                    None,
                                    &OriginScope::Prefix(origin.clone()),
                                    None,
                                ),
                                false,
                            ),
                            ClearTarget::Pattern { pattern } => (
                                initializer::clear_matching_origins(
                                    ctx,
                                    None,
                                    &OriginScope::Pattern(pattern.clone()),
                                    None,
                                ),
                                false,
                            ),
                            ClearTarget::PrivateRepository => (
                                initializer::clear_repository(ctx, PersistenceType::Private),
                                false,
                            ),
                            ClearTarget::All => (initializer::clear_all(ctx), true),
                            ClearTarget::ShutdownStorage => {
                                (initializer::shutdown_storage(ctx), true)
                            }
                        };
                        drop(lock);
                        let _ = owner_tx.send(OwnerMessage::RunOnOwner(Box::new(
                            move |owner| {
                                if reset_state && result.is_ok() {
                                    owner.init_state = StorageInitState::Uninitialized;
                                    owner.storage_in_flight = false;
                                    owner.temp_in_flight = false;
                                }
                                let _ = reply.send(result);
                            },
                        )));
                    }),
                );
            }
        }));
        self.registry
            .create_and_acquire(scope, true, category, waiter);
    }

    fn handle_persist_origin(&mut self, metadata: OriginMetadata, reply: ReplySender<()>) {
        if self.shutting_down() {
            let _ = reply.send(Err(Error::ShutdownAborted));
            return;
        }
        let scope = LockScope::origin(PersistenceType::Default, metadata.origin.clone());
        let io_tx = self.io_tx.clone();
        let owner_tx = self.owner_tx.clone();
        let waiter = LockWaiter::Internal(Box::new(move |result| match result {
            Err(e) => {
                let _ = reply.send(Err(e));
            }
            Ok(lock) => {
                io::dispatch(
                    &io_tx,
                    Box::new(move |ctx| {
                        let result = initializer::persist_origin(ctx, &metadata);
                        drop(lock);
                        let _ = owner_tx.send(OwnerMessage::RunOnOwner(Box::new(
                            move |_owner| {
                                let _ = reply.send(result);
                            },
                        )));
                    }),
                );
            }
        }));
        self.registry
            .create_and_acquire(scope, true, LockCategory::None, waiter);
    }
}

fn run_owner(mut state: OwnerState, rx: Receiver<OwnerMessage>) {
    while let Ok(message) = rx.recv() {
        if !state.handle(message) {
            break;
        }
    }
    debug!("owning thread stopped");
}

// ---- Synchronous eviction gate ----

struct EngineGate {
    owner_tx: Sender<OwnerMessage>,
    io_tx: Sender<IoMessage>,
    shutdown: Arc<AtomicBool>,
}

impl EvictionGate for EngineGate {
    fn try_free_space(&self, min_bytes: u64) -> u64 {
        if self.shutdown.load(Ordering::SeqCst) {
            return 0;
        }

        let (waiter, sender) = rendezvous();
        if self
            .owner_tx
            .send(OwnerMessage::CollectEviction {
                min_bytes,
                rendezvous: sender,
            })
            .is_err()
        {
            return 0;
        }
        let (candidates, locks, _) = waiter.wait();
        if candidates.is_empty() {
            return 0;
        }

        let (done_waiter, done_sender) = rendezvous();
        let dispatched = io::dispatch(
            &self.io_tx,
            Box::new(move |ctx| {
                done_sender.send(initializer::evict_candidates(ctx, &candidates));
            }),
        );
        let freed = if dispatched { done_waiter.wait() } else { 0 };
        drop(locks);
        freed
    }
}

// ---- Watchdog timers ----

struct Watchdog {
    state: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Watchdog {
    fn start(name: &str, timeout: Duration, action: impl FnOnce() + Send + 'static) -> Self {
        let state = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name(format!("quotastore-{name}"))
            .spawn(move || {
                let (cancelled, cvar) = &*thread_state;
                let deadline = Instant::now() + timeout;
                let mut guard = cancelled.lock();
                while !*guard {
                    if cvar.wait_until(&mut guard, deadline).timed_out() {
                        break;
                    }
                }
                let fired = !*guard;
                drop(guard);
                if fired {
                    action();
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn watchdog thread: {e}"));
        Self {
            state,
            handle: Some(handle),
        }
    }

    fn cancel(mut self) {
        self.cancel_inner();
    }

    fn cancel_inner(&mut self) {
        let (cancelled, cvar) = &*self.state;
        *cancelled.lock() = true;
        cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel_inner();
    }
}

// ---- Facade ----

/// The quota engine facade. One instance is constructed by the storage
/// bootstrap sequence and handed to collaborators by reference.
pub struct QuotaManager {
    owner_tx: Sender<OwnerMessage>,
    owner_handle: Option<thread::JoinHandle<()>>,
    io: IoThread,
    tracker: Arc<UsageTracker>,
    clients: Arc<Clients>,
    gate: Arc<dyn EvictionGate>,
    shutdown: Arc<AtomicBool>,
    config: QuotaConfig,
    torn_down: bool,
}

impl QuotaManager {
    /// Build the engine: spawns the owning thread and the IO thread.
    #[must_use]
    pub fn new(config: QuotaConfig, clients: Vec<Arc<dyn crate::client::Client>>) -> Self {
        let tracker = Arc::new(UsageTracker::new());
        let clients = Arc::new(Clients::new(clients));
        let shutdown = Arc::new(AtomicBool::new(false));
        let layout = StorageLayout::new(&config.storage.root);

        let (owner_tx, owner_rx) = unbounded();

        let io = IoThread::spawn(IoContext {
            layout,
            config: config.clone(),
            tracker: Arc::clone(&tracker),
            clients: Arc::clone(&clients),
            shutdown: Arc::clone(&shutdown),
            owner_tx: owner_tx.clone(),
            db: None,
            cache_usable: false,
            origin_states: HashMap::new(),
        });
        let io_tx = io.sender();

        let dropper: LockDropper = {
            let tx = owner_tx.clone();
            Arc::new(move |id| {
                let _ = tx.send(OwnerMessage::ReleaseLock(id));
            })
        };

        let gate: Arc<dyn EvictionGate> = Arc::new(EngineGate {
            owner_tx: owner_tx.clone(),
            io_tx: io_tx.clone(),
            shutdown: Arc::clone(&shutdown),
        });

        let owner_state = OwnerState {
            registry: LockRegistry::new(dropper),
            init_state: StorageInitState::Uninitialized,
            storage_in_flight: false,
            temp_in_flight: false,
            storage_waiters: Vec::new(),
            temp_waiters: Vec::new(),
            tracker: Arc::clone(&tracker),
            clients: Arc::clone(&clients),
            config: config.clone(),
            shutdown: Arc::clone(&shutdown),
            owner_tx: owner_tx.clone(),
            io_tx,
        };
        let owner_handle = thread::Builder::new()
            .name("quotastore-owner".to_string())
            .spawn(move || run_owner(owner_state, owner_rx))
            .unwrap_or_else(|e| panic!("failed to spawn owning thread: {e}"));

        info!(root = %config.storage.root.display(), "quota manager created");
        Self {
            owner_tx,
            owner_handle: Some(owner_handle),
            io,
            tracker,
            clients,
            gate,
            shutdown,
            config,
            torn_down: false,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(ReplySender<T>) -> OwnerMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.owner_tx
            .send(build(tx))
            .map_err(|_| Error::ShutdownAborted)?;
        rx.await.map_err(|_| Error::ShutdownAborted)?
    }

    // ---- Public async surface ----

    /// Open/create the top-level database, apply migrations and
    /// validate the usage cache.
    pub async fn initialize_storage(&self) -> Result<()> {
        self.request(|reply| OwnerMessage::InitializeStorage { reply })
            .await
    }

    /// Load (or rebuild) usage accounting and arm the global limit.
    /// Implies [`Self::initialize_storage`].
    pub async fn initialize_temporary_storage(&self) -> Result<()> {
        self.request(|reply| OwnerMessage::InitializeTemporaryStorage { reply })
            .await
    }

    /// Acquire a directory lock over an arbitrary region of the
    /// storage tree.
    pub async fn open_storage_directory(
        &self,
        persistence_type: Option<PersistenceType>,
        origin_scope: OriginScope,
        client_type: Option<ClientType>,
        exclusive: bool,
    ) -> Result<DirectoryLock> {
        self.initialize_storage().await?;
        self.request(|reply| OwnerMessage::OpenDirectory {
            scope: LockScope {
                persistence_type,
                origin_scope,
                client_type,
            },
            exclusive,
            category: LockCategory::None,
            reply,
        })
        .await
    }

    /// Acquire a shared lock on one client directory, lazily
    /// initializing the origin. Two concurrent calls for the same
    /// origin/client resolve without waiting on each other.
    pub async fn open_client_directory(
        &self,
        metadata: &OriginMetadata,
        client_type: ClientType,
    ) -> Result<DirectoryLock> {
        if metadata.persistence_type.is_best_effort() {
            self.initialize_temporary_storage().await?;
        } else {
            self.initialize_storage().await?;
        }
        let metadata = metadata.clone();
        self.request(move |reply| OwnerMessage::OpenClientDirectory {
            metadata,
            client_type,
            reply,
        })
        .await
    }

    /// Delete the storages of one origin (optionally one repository
    /// and/or one client).
    pub async fn clear_storages_for_origin(
        &self,
        persistence_type: Option<PersistenceType>,
        metadata: &OriginMetadata,
        client_type: Option<ClientType>,
    ) -> Result<()> {
        self.initialize_storage().await?;
        let metadata = metadata.clone();
        self.request(move |reply| OwnerMessage::Clear {
            target: ClearTarget::Origin {
                persistence_type,
                metadata,
                client_type,
            },
            reply,
        })
        .await
    }

    /// Delete every origin sharing a suffix-stripped origin prefix.
    pub async fn clear_storages_for_origin_prefix(&self, origin: &str) -> Result<()> {
        self.initialize_storage().await?;
        let origin = origin.to_string();
        self.request(move |reply| OwnerMessage::Clear {
            target: ClearTarget::Prefix { origin },
            reply,
        })
        .await
    }

    /// Delete every origin whose attributes match the pattern.
    pub async fn clear_storages_for_attributes_pattern(
        &self,
        pattern: &OriginAttributesPattern,
    ) -> Result<()> {
        self.initialize_storage().await?;
        let pattern = pattern.clone();
        self.request(move |reply| OwnerMessage::Clear {
            target: ClearTarget::Pattern { pattern },
            reply,
        })
        .await
    }

    /// Wipe the private-browsing repository.
    pub async fn clear_private_repository(&self) -> Result<()> {
        self.initialize_storage().await?;
        self.request(|reply| OwnerMessage::Clear {
            target: ClearTarget::PrivateRepository,
            reply,
        })
        .await
    }

    /// Wipe the whole storage tree and reset the engine to
    /// uninitialized.
    pub async fn clear_storage(&self) -> Result<()> {
        self.request(|reply| OwnerMessage::Clear {
            target: ClearTarget::All,
            reply,
        })
        .await
    }

    /// Close the storage connection after all in-flight work: writes
    /// the usage cache and drops the database handle, keeping files.
    pub async fn shutdown_storage(&self) -> Result<()> {
        self.request(|reply| OwnerMessage::Clear {
            target: ClearTarget::ShutdownStorage,
            reply,
        })
        .await
    }

    /// Total usage of one origin: tracked best-effort usage plus its
    /// persistent repository data.
    pub async fn get_origin_usage(&self, metadata: &OriginMetadata) -> Result<u64> {
        self.initialize_temporary_storage().await?;
        let metadata = metadata.clone();
        self.request(move |reply| OwnerMessage::GetOriginUsage { metadata, reply })
            .await
    }

    /// Usage of one client within an origin.
    pub async fn get_usage_for_client(
        &self,
        metadata: &OriginMetadata,
        client_type: ClientType,
    ) -> Result<Option<u64>> {
        self.initialize_temporary_storage().await?;
        let metadata = metadata.clone();
        self.request(move |reply| OwnerMessage::GetUsageForClient {
            metadata,
            client_type,
            reply,
        })
        .await
    }

    /// Whether the origin's default-persistence data is pinned.
    pub async fn origin_persisted(&self, metadata: &OriginMetadata) -> Result<bool> {
        self.initialize_temporary_storage().await?;
        let metadata = metadata.clone();
        self.request(move |reply| OwnerMessage::OriginPersisted { metadata, reply })
            .await
    }

    /// Pin an origin's default-persistence data against eviction.
    pub async fn persist_origin(&self, metadata: &OriginMetadata) -> Result<()> {
        self.initialize_temporary_storage().await?;
        let metadata = metadata.clone();
        self.request(move |reply| OwnerMessage::PersistOrigin { metadata, reply })
            .await
    }

    /// Current engine initialization state (diagnostics).
    pub async fn init_state(&self) -> StorageInitState {
        let (tx, rx) = oneshot::channel();
        if self
            .owner_tx
            .send(OwnerMessage::GetInitState { reply: tx })
            .is_err()
        {
            return StorageInitState::Uninitialized;
        }
        rx.await.unwrap_or(StorageInitState::Uninitialized)
    }

    // ---- Synchronous surface ----

    /// Per-file size handle for client code; `None` for persistent
    /// origins. Callable from any thread except the engine's own IO
    /// thread.
    #[must_use]
    pub fn get_quota_object(
        &self,
        metadata: &OriginMetadata,
        client_type: ClientType,
        path: PathBuf,
        file_size: u64,
    ) -> Option<QuotaObject> {
        self.tracker.get_quota_object(
            metadata,
            client_type,
            path,
            file_size,
            Arc::clone(&self.gate),
        )
    }

    /// Process-wide best-effort usage counter.
    #[must_use]
    pub fn total_usage(&self) -> u64 {
        self.tracker.total_usage()
    }

    /// Group limit derived from the configured global limit.
    #[must_use]
    pub fn group_limit(&self) -> u64 {
        group_limit(self.config.storage.temporary_storage_limit)
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Shared usage tracker (for clients reporting usage deltas).
    #[must_use]
    pub fn tracker(&self) -> &Arc<UsageTracker> {
        &self.tracker
    }

    // ---- Shutdown ----

    /// Full bounded teardown. Blocks the calling thread; must not be
    /// called from an async context or from engine threads.
    pub fn shutdown(mut self) {
        info!("quota manager shutdown started");

        // Private-browsing data must not outlive the session; tear the
        // storage connection down behind an exclusive universal lock so
        // it runs after all in-flight work.
        let (private_tx, private_rx) = oneshot::channel();
        let _ = self.owner_tx.send(OwnerMessage::Clear {
            target: ClearTarget::PrivateRepository,
            reply: private_tx,
        });
        let (storage_tx, storage_rx) = oneshot::channel();
        let _ = self.owner_tx.send(OwnerMessage::Clear {
            target: ClearTarget::ShutdownStorage,
            reply: storage_tx,
        });

        // From here on the engine rejects new work.
        self.shutdown.store(true, Ordering::SeqCst);

        let fatal = Watchdog::start(
            "shutdown-fatal",
            Duration::from_millis(self.config.shutdown.fatal_timeout_ms),
            || {
                error!("quota manager shutdown timed out");
                std::process::abort();
            },
        );

        if let Ok(Err(e)) = private_rx.blocking_recv() {
            if !e.is_not_found() {
                warn!(error = %e, "private repository cleanup failed during shutdown");
            }
        }
        if let Ok(Err(e)) = storage_rx.blocking_recv() {
            warn!(error = %e, "storage teardown failed during shutdown");
        }

        let needs_wait = self
            .clients
            .iter()
            .fold(false, |acc, client| client.initiate_shutdown_work_threads() || acc);

        if needs_wait {
            let clients = Arc::clone(&self.clients);
            let force_kill = Watchdog::start(
                "shutdown-force-kill",
                Duration::from_millis(self.config.shutdown.force_kill_timeout_ms),
                move || {
                    warn!("clients did not complete shutdown in time, force-killing actors");
                    for client in clients.iter() {
                        client.abort_operations_for_process();
                        client.force_kill_actors();
                    }
                },
            );
            while !self.clients.iter().all(|client| client.is_shutdown_completed()) {
                thread::sleep(Duration::from_millis(50));
            }
            force_kill.cancel();
        }

        for client in self.clients.iter() {
            client.finalize_shutdown_work_threads();
        }

        self.io.stop_and_join();

        let _ = self.owner_tx.send(OwnerMessage::Stop);
        if let Some(handle) = self.owner_handle.take() {
            let _ = handle.join();
        }

        fatal.cancel();
        self.torn_down = true;
        info!("quota manager shutdown complete");
    }
}

impl Drop for QuotaManager {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        // Minimal teardown for instances dropped without shutdown().
        self.shutdown.store(true, Ordering::SeqCst);
        self.io.stop_and_join();
        let _ = self.owner_tx.send(OwnerMessage::Stop);
        if let Some(handle) = self.owner_handle.take() {
            let _ = handle.join();
        }
    }
}
