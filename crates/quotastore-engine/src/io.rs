//! Dedicated serial IO thread
//!
//! All filesystem and database work runs here, one job at a time, in
//! submission order. Jobs receive the mutable [`IoContext`]; results
//! cross back to the owning thread as `RunOnOwner` messages.

use crate::client::Clients;
use crate::initializer::OriginInitState;
use crate::manager::OwnerMessage;
use crate::tracker::UsageTracker;
use crossbeam_channel::{Receiver, Sender, unbounded};
use quotastore_common::{PersistenceType, QuotaConfig};
use quotastore_db::{QuotaDb, StorageLayout};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use tracing::debug;

pub(crate) type IoJob = Box<dyn FnOnce(&mut IoContext) + Send + 'static>;

pub(crate) enum IoMessage {
    Job(IoJob),
    Stop,
}

/// State owned by the IO thread.
pub(crate) struct IoContext {
    pub layout: StorageLayout,
    pub config: QuotaConfig,
    pub tracker: Arc<UsageTracker>,
    pub clients: Arc<Clients>,
    pub shutdown: Arc<AtomicBool>,
    pub owner_tx: Sender<OwnerMessage>,
    /// Open database connection; `Some` once storage is initialized.
    pub db: Option<QuotaDb>,
    /// Whether the usage-cache tables are usable this session.
    pub cache_usable: bool,
    /// Per-origin initialization sub-machine states.
    pub origin_states: HashMap<(PersistenceType, String), OriginInitState>,
}

pub(crate) struct IoThread {
    tx: Sender<IoMessage>,
    handle: Option<thread::JoinHandle<()>>,
}

impl IoThread {
    pub(crate) fn spawn(mut ctx: IoContext) -> Self {
        let (tx, rx): (Sender<IoMessage>, Receiver<IoMessage>) = unbounded();
        let handle = thread::Builder::new()
            .name("quotastore-io".to_string())
            .spawn(move || {
                while let Ok(message) = rx.recv() {
                    match message {
                        IoMessage::Job(job) => job(&mut ctx),
                        IoMessage::Stop => break,
                    }
                }
                debug!("IO thread stopped");
            })
            .unwrap_or_else(|e| panic!("failed to spawn IO thread: {e}"));
        Self {
            tx,
            handle: Some(handle),
        }
    }

    pub(crate) fn sender(&self) -> Sender<IoMessage> {
        self.tx.clone()
    }

    /// Ask the thread to stop after draining queued jobs, then join it.
    pub(crate) fn stop_and_join(&mut self) {
        let _ = self.tx.send(IoMessage::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Submit a job through a cloned sender. Returns `false` if the thread
/// is gone.
pub(crate) fn dispatch(tx: &Sender<IoMessage>, job: IoJob) -> bool {
    tx.send(IoMessage::Job(job)).is_ok()
}
