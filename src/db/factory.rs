//! Database provisioning with a pre-warmed cache instance
//!
//! The factory keeps at most one fully initialized spare instance at
//! `cached_db/` under its root. A request for a fresh path is satisfied by
//! renaming the spare into place, which keeps database creation cost off
//! the request path. All filesystem and database work runs on one dedicated
//! initialization thread; requesting tasks post a job and suspend through
//! their [`TaskHandle`].

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use rand::RngCore;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::instance::LedgerDb;
use crate::coroutine::TaskHandle;
use crate::status::{Result, Status};

/// Fixed subdirectory for in-flight instance creation
pub const STAGING_DIR: &str = "staging";
/// Fixed subdirectory holding the single pre-warmed instance
pub const CACHED_DB_DIR: &str = "cached_db";

const STAGING_ID_BYTES: usize = 16;

type IoJob = Box<dyn FnOnce() + Send + 'static>;

/// Dedicated initialization thread with a FIFO job queue
struct IoThread {
    jobs: Option<mpsc::Sender<IoJob>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl IoThread {
    fn spawn() -> Result<IoThread> {
        let (tx, rx) = mpsc::channel::<IoJob>();
        let worker = thread::Builder::new()
            .name("ledgerstore-db-init".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
                debug!("IoThread: job queue closed, worker exiting");
            })?;
        Ok(IoThread {
            jobs: Some(tx),
            worker: Some(worker),
        })
    }

    fn post(&self, job: IoJob) {
        if let Some(jobs) = &self.jobs
            && jobs.send(job).is_err()
        {
            warn!("IoThread::post: worker is gone, dropping job");
        }
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        // closing the queue lets the worker drain in-flight jobs and exit
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Shared between one suspended requester and its background job.
///
/// Both sides take the same lock around the cancelled check and the
/// cancelled set, which makes all three orderings of interruption versus
/// completion safe: whichever side locks first wins, and the loser observes
/// a consistent flag.
struct CancellationFlag<T> {
    inner: Mutex<FlagInner<T>>,
}

struct FlagInner<T> {
    cancelled: bool,
    responder: Option<oneshot::Sender<T>>,
}

impl<T> CancellationFlag<T> {
    fn new(responder: oneshot::Sender<T>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FlagInner {
                cancelled: false,
                responder: Some(responder),
            }),
        })
    }

    /// Requester side: mark the request cancelled after an interruption
    fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.cancelled = true;
        inner.responder.take();
    }

    /// Background side: run the finishing work and respond with its result,
    /// unless the requester already cancelled. Returns whether the work ran.
    fn finish_with(&self, produce: impl FnOnce() -> T) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.cancelled {
            return false;
        }
        let value = produce();
        if let Some(responder) = inner.responder.take() {
            let _ = responder.send(value);
        }
        true
    }
}

/// Cache slot lifecycle. `Failed` is absorbing: pre-warming is never
/// retried after a single failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheSlot {
    Empty,
    Preparing,
    Ready,
    Failed,
}

/// The single parked request waiting for the in-flight preparation.
/// Deliberately not a queue: a second waiter is routed to direct creation.
struct ParkedRequest {
    id: u64,
    path: PathBuf,
    responder: oneshot::Sender<Result<LedgerDb>>,
}

struct FactoryInner {
    slot: CacheSlot,
    /// Terminal preparation failure, kept for observability
    cached_db_status: Option<Status>,
    parked: Option<ParkedRequest>,
    next_request_id: u64,
}

/// Provisions [`LedgerDb`] instances under a root directory, pre-warming
/// one spare ahead of demand.
pub struct DbFactory {
    root: PathBuf,
    inner: Arc<Mutex<FactoryInner>>,
    io: IoThread,
}

impl DbFactory {
    /// Create a factory rooted at `root`. No filesystem work happens until
    /// [`DbFactory::init`].
    pub fn new(root: impl Into<PathBuf>) -> Result<DbFactory> {
        let root = root.into();
        debug!(?root, "DbFactory::new: called");
        Ok(DbFactory {
            root,
            inner: Arc::new(Mutex::new(FactoryInner {
                slot: CacheSlot::Empty,
                cached_db_status: None,
                parked: None,
                next_request_id: 0,
            })),
            io: IoThread::spawn()?,
        })
    }

    /// Begin preparing the cache-slot instance, or adopt one left on disk
    /// by a previous run. Also sweeps stale staging directories from a
    /// previous crash. Idempotent.
    pub fn init(&self) -> Result<()> {
        debug!(root = ?self.root, "DbFactory::init: called");
        std::fs::create_dir_all(self.root.join(STAGING_DIR))?;
        self.sweep_staging();

        let mut inner = self.lock();
        if inner.slot != CacheSlot::Empty {
            return Ok(());
        }
        if self.root.join(CACHED_DB_DIR).is_dir() {
            info!(root = ?self.root, "DbFactory::init: adopting existing cached instance");
            inner.slot = CacheSlot::Ready;
        } else {
            inner.slot = CacheSlot::Preparing;
            drop(inner);
            self.post_cache_preparation();
        }
        Ok(())
    }

    /// Resolve to a ready database instance at `path`.
    ///
    /// Resolution order: an existing directory is opened in place; a failed
    /// cache slot routes to direct staged creation; a ready spare is renamed
    /// into place and a replacement preparation starts; while preparing, the
    /// first request parks and any further request goes direct.
    pub async fn get_or_create_db(&self, handle: &TaskHandle, path: impl Into<PathBuf>) -> Result<LedgerDb> {
        let path = path.into();
        debug!(?path, "DbFactory::get_or_create_db: called");

        if path.is_dir() {
            debug!(?path, "DbFactory::get_or_create_db: opening existing instance");
            return self.open_existing(handle, path).await;
        }

        enum Plan {
            Direct,
            FromCache,
            Park(u64, oneshot::Receiver<Result<LedgerDb>>),
        }

        let plan = {
            let mut inner = self.lock();
            match inner.slot {
                // Empty means init() was never called; Failed means
                // pre-warming is permanently disabled. Both go direct.
                CacheSlot::Empty | CacheSlot::Failed => Plan::Direct,
                CacheSlot::Ready => {
                    // rename under the lock so no two requests claim the
                    // same cached instance
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::rename(self.root.join(CACHED_DB_DIR), &path)?;
                    inner.slot = CacheSlot::Preparing;
                    Plan::FromCache
                }
                CacheSlot::Preparing => {
                    if inner.parked.is_none() {
                        let id = inner.next_request_id;
                        inner.next_request_id += 1;
                        let (tx, rx) = oneshot::channel();
                        inner.parked = Some(ParkedRequest {
                            id,
                            path: path.clone(),
                            responder: tx,
                        });
                        Plan::Park(id, rx)
                    } else {
                        // single-waiter by design, overflow goes direct
                        Plan::Direct
                    }
                }
            }
        };

        match plan {
            Plan::FromCache => {
                debug!(?path, "DbFactory::get_or_create_db: satisfied from cache slot");
                self.post_cache_preparation();
                self.open_existing(handle, path).await
            }
            Plan::Park(id, rx) => {
                debug!(?path, "DbFactory::get_or_create_db: parked behind cache preparation");
                match handle.block_on(rx).await {
                    Ok(result) => result,
                    Err(status) => {
                        // withdraw our parked request; preparation may have
                        // already satisfied it and parked someone else
                        let mut inner = self.lock();
                        if inner.parked.as_ref().is_some_and(|parked| parked.id == id) {
                            inner.parked = None;
                        }
                        Err(status)
                    }
                }
            }
            Plan::Direct => self.create_staged(handle, path).await,
        }
    }

    /// Terminal cache-preparation failure, if any
    pub fn cached_db_status(&self) -> Option<Status> {
        self.lock().cached_db_status.clone()
    }

    fn lock(&self) -> MutexGuard<'_, FactoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the instance at `path` on the initialization thread
    async fn open_existing(&self, handle: &TaskHandle, path: PathBuf) -> Result<LedgerDb> {
        let (tx, rx) = oneshot::channel();
        let flag = CancellationFlag::new(tx);
        let job_flag = Arc::clone(&flag);
        self.io.post(Box::new(move || {
            if !job_flag.finish_with(|| LedgerDb::open(&path)) {
                debug!(?path, "DbFactory: open discarded after cancellation");
            }
        }));
        match handle.block_on(rx).await {
            Ok(result) => result,
            Err(status) => {
                flag.cancel();
                Err(status)
            }
        }
    }

    /// Create a fresh instance at `path` via the staging protocol
    async fn create_staged(&self, handle: &TaskHandle, path: PathBuf) -> Result<LedgerDb> {
        let staging = self.root.join(STAGING_DIR).join(staging_dir_name());
        debug!(?path, ?staging, "DbFactory::create_staged: called");

        let (tx, rx) = oneshot::channel();
        let flag = CancellationFlag::new(tx);
        let job_flag = Arc::clone(&flag);
        self.io.post(Box::new(move || {
            match LedgerDb::init_at(&staging) {
                Ok(()) => {
                    let delivered = job_flag.finish_with(|| match promote(&staging, &path) {
                        Ok(()) => LedgerDb::open(&path),
                        Err(status) => {
                            let _ = std::fs::remove_dir_all(&staging);
                            Err(status)
                        }
                    });
                    if !delivered {
                        // cancelled before the rename: nothing may appear
                        // at the destination
                        debug!(?staging, "DbFactory: staged creation discarded after cancellation");
                        let _ = std::fs::remove_dir_all(&staging);
                    }
                }
                Err(status) => {
                    let _ = std::fs::remove_dir_all(&staging);
                    job_flag.finish_with(|| Err(status));
                }
            }
        }));

        match handle.block_on(rx).await {
            Ok(result) => result,
            Err(status) => {
                flag.cancel();
                Err(status)
            }
        }
    }

    fn post_cache_preparation(&self) {
        let Some(jobs) = self.io.jobs.as_ref() else {
            return;
        };
        let job = cache_preparation_job(jobs.clone(), self.root.clone(), Arc::clone(&self.inner));
        if jobs.send(job).is_err() {
            warn!("DbFactory::post_cache_preparation: worker is gone");
        }
    }

    /// Remove leftover staging directories from a previous crash
    fn sweep_staging(&self) {
        let staging_root = self.root.join(STAGING_DIR);
        let Ok(entries) = std::fs::read_dir(&staging_root) else {
            return;
        };
        for entry in entries.flatten() {
            warn!(path = ?entry.path(), "DbFactory::sweep_staging: removing stale staging entry");
            let _ = std::fs::remove_dir_all(entry.path());
        }
    }
}

/// Random, fixed-length, hex-encoded staging directory name
fn staging_dir_name() -> String {
    let mut bytes = [0u8; STAGING_ID_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Atomically move a fully initialized staging directory to `target`
fn promote(staging: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(staging, target)?;
    Ok(())
}

/// One cache-slot preparation cycle, run on the initialization thread.
///
/// On success the fresh instance either lands at `cached_db/` (slot
/// `Ready`) or is handed straight to the parked waiter, in which case a
/// replacement preparation is posted. A failure is terminal for the slot.
fn cache_preparation_job(jobs: mpsc::Sender<IoJob>, root: PathBuf, inner: Arc<Mutex<FactoryInner>>) -> IoJob {
    Box::new(move || {
        let target = root.join(CACHED_DB_DIR);
        let staging = root.join(STAGING_DIR).join(staging_dir_name());
        debug!(?staging, ?target, "DbFactory: preparing cache instance");

        let prepared = LedgerDb::init_at(&staging).and_then(|()| promote(&staging, &target));
        if prepared.is_err() {
            let _ = std::fs::remove_dir_all(&staging);
        }

        let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
        match prepared {
            Ok(()) => {
                if let Some(parked) = guard.parked.take() {
                    debug!(path = ?parked.path, "DbFactory: handing fresh instance to parked request");
                    match promote(&target, &parked.path) {
                        Ok(()) => {
                            let _ = parked.responder.send(LedgerDb::open(&parked.path));
                            guard.slot = CacheSlot::Preparing;
                            drop(guard);
                            let replacement = cache_preparation_job(jobs.clone(), root.clone(), Arc::clone(&inner));
                            if jobs.send(replacement).is_err() {
                                warn!("DbFactory: worker gone, replacement preparation dropped");
                            }
                        }
                        Err(status) => {
                            // the instance is intact at cached_db/, keep it
                            let _ = parked.responder.send(Err(status));
                            guard.slot = CacheSlot::Ready;
                        }
                    }
                } else {
                    guard.slot = CacheSlot::Ready;
                    debug!("DbFactory: cache instance ready");
                }
            }
            Err(status) => {
                warn!(%status, "DbFactory: cache preparation failed, pre-warming disabled");
                guard.slot = CacheSlot::Failed;
                guard.cached_db_status = Some(status.clone());
                if let Some(parked) = guard.parked.take() {
                    let _ = parked.responder.send(Err(status));
                }
            }
        }
    })
}
