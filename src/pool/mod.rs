//! Dynamically-sized pool of headless browsers.
//!
//! Page requests are multiplexed over a bounded fleet of browsers. Each
//! browser is retired after a bounded amount of use so that memory leaks
//! and fingerprint reuse stay bounded with it. Disk-cache directories can
//! be recycled across browser generations, and every child process is torn
//! down on destroy or interrupt.
//!
//! A browser moves through `launching -> active -> retired -> killed`.
//! Active browsers accept new pages while retired browsers only drain the
//! pages they already have. The background reaper kills retired browsers
//! that have gone idle or empty.

mod cache;
mod config;
mod instance;
mod reaper;

pub use config::{PoolConfig, PoolConfigBuilder};

use futures::future::join_all;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::handle::{BrowserEvent, BrowserHandle, Page, TargetKind, same_handle};
use crate::launcher::{LaunchOptions, Launcher};
use instance::{BrowserInstance, LaunchOutcome};

/// Grace between the last page closing on a retired browser and its kill,
/// so the close that triggered the event can finish first.
const PAGE_CLOSE_KILL_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum wait between requesting an orderly close and hard-killing the
/// browser child.
const PROCESS_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Browsers accepting new pages.
    pub active: usize,
    /// Browsers draining their remaining pages.
    pub retired: usize,
    /// Disk-cache directories waiting for reuse.
    pub recycled_cache_dirs: usize,
}

/// Pool of headless browsers serving page requests.
///
/// Cheap to clone; all clones share one pool. Must be created inside a tokio
/// runtime, since construction spawns the reaper and the interrupt hook.
#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    max_open_pages_per_instance: usize,
    retire_instance_after_page_count: usize,
    pub(crate) kill_instance_after: Duration,
    recycle_disk_cache: bool,
    launcher: Arc<dyn Launcher>,
    launch_options: LaunchOptions,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) destroyed: AtomicBool,
    reaper_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    interrupt_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
pub(crate) struct PoolState {
    pub(crate) active: BTreeMap<u64, Arc<BrowserInstance>>,
    pub(crate) retired: BTreeMap<u64, Arc<BrowserInstance>>,
    recycled_cache_dirs: VecDeque<PathBuf>,
    next_id: u64,
}

impl BrowserPool {
    /// Create a pool and start its background tasks.
    pub fn new(config: PoolConfig) -> Self {
        let recycle_disk_cache = config.effective_recycle_disk_cache();
        let inner = Arc::new(PoolInner {
            max_open_pages_per_instance: config.max_open_pages_per_instance,
            retire_instance_after_page_count: config.retire_instance_after_page_count,
            kill_instance_after: config.kill_instance_after,
            recycle_disk_cache,
            launcher: config.launcher,
            launch_options: config.launch_options,
            state: Mutex::new(PoolState::default()),
            destroyed: AtomicBool::new(false),
            reaper_task: std::sync::Mutex::new(None),
            interrupt_task: std::sync::Mutex::new(None),
        });

        let reaper = tokio::spawn(reaper::reaper_loop(
            Arc::downgrade(&inner),
            config.instance_killer_interval,
        ));
        *inner.reaper_task.lock().expect("lock poisoned") = Some(reaper);

        let interrupt = tokio::spawn(interrupt_loop(Arc::downgrade(&inner)));
        *inner.interrupt_task.lock().expect("lock poisoned") = Some(interrupt);

        Self { inner }
    }

    /// Open a page on an active browser, launching a new browser when every
    /// active one is saturated.
    ///
    /// Errors are transient: the browser that failed has already been
    /// retired and a retry is served elsewhere.
    pub async fn new_page(&self) -> Result<Page, PoolError> {
        let instance = {
            let mut state = self.inner.state.lock().await;
            if self.inner.destroyed.load(Ordering::SeqCst) {
                return Err(PoolError::Destroyed);
            }

            let mut candidate = None;
            for instance in state.active.values() {
                if instance.active_pages() < self.inner.max_open_pages_per_instance {
                    // last eligible wins
                    candidate = Some(Arc::clone(instance));
                }
            }
            let instance = match candidate {
                Some(instance) => instance,
                None => self.inner.launch_instance(&mut state),
            };

            // Counters move before any await so a concurrent caller sees the
            // allocation; the lifetime-cap retirement likewise happens before
            // page creation is awaited.
            let total = instance.note_page_opened();
            if total >= self.inner.retire_instance_after_page_count
                && let Some(instance) = state.active.remove(&instance.id)
            {
                debug!(
                    id = instance.id,
                    total, "retiring browser at its lifetime page cap"
                );
                state.retired.insert(instance.id, instance);
            }
            instance
        };

        let handle = match instance.browser().await {
            Ok(handle) => handle,
            // the launch driver has already logged and retired
            Err(e) => return Err(PoolError::launch(e.as_ref())),
        };

        let page = match handle.new_page().await {
            Ok(page) => page,
            Err(e) => {
                warn!(id = instance.id, "page creation failed: {e:#}");
                self.inner.retire_by_id(instance.id).await;
                return Err(PoolError::page_creation(&e));
            }
        };

        // Watch for a fatal page error: log, close the page, swallow.
        let watched = Arc::clone(&page);
        let id = instance.id;
        tokio::spawn(async move {
            if watched.crashed().await {
                warn!(id, "page crashed; closing it");
                if let Err(e) = watched.close().await {
                    debug!(id, "closing crashed page failed: {e:#}");
                }
            }
        });

        Ok(page)
    }

    /// Retire the instance owning the given browser.
    ///
    /// Matching is by identity. A browser the pool no longer knows (already
    /// retired, or never pooled) is ignored.
    pub async fn retire(&self, browser: &Arc<dyn BrowserHandle>) {
        let mut state = self.inner.state.lock().await;
        let id = state.active.values().find_map(|instance| {
            match instance.browser_if_ready() {
                Some(Ok(handle)) if same_handle(&handle, browser) => Some(instance.id),
                _ => None,
            }
        });
        if let Some(id) = id
            && let Some(instance) = state.active.remove(&id)
        {
            debug!(id, "browser retired on request");
            state.retired.insert(id, instance);
        }
    }

    /// Tear the whole pool down: the background tasks stop, every browser
    /// is closed and every cache directory is deleted. Never fails;
    /// repeated calls are no-ops.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("destroying browser pool");

        if let Some(task) = inner.reaper_task.lock().expect("lock poisoned").take() {
            task.abort();
        }
        if let Some(task) = inner.interrupt_task.lock().expect("lock poisoned").take() {
            task.abort();
        }

        let (instances, recycled_dirs) = {
            let mut state = inner.state.lock().await;
            let instances: Vec<_> = state
                .active
                .values()
                .cloned()
                .chain(state.retired.values().cloned())
                .collect();
            state.active.clear();
            state.retired.clear();
            let recycled_dirs: Vec<_> = state.recycled_cache_dirs.drain(..).collect();
            (instances, recycled_dirs)
        };

        // killed is set first so the resulting disconnect events stay quiet
        let closes = instances.iter().map(|instance| async move {
            instance.mark_killed();
            if let Some(Ok(handle)) = instance.browser_if_ready()
                && let Err(e) = handle.close().await
            {
                warn!(
                    id = instance.id,
                    "browser close failed during destroy: {e:#}"
                );
            }
        });
        join_all(closes).await;

        for instance in &instances {
            if let Some(dir) = instance.take_cache_dir() {
                cache::remove_cache_dir(&dir);
            }
        }
        for dir in recycled_dirs {
            cache::remove_cache_dir(&dir);
        }
    }

    /// Current pool counters.
    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        PoolStats {
            active: state.active.len(),
            retired: state.retired.len(),
            recycled_cache_dirs: state.recycled_cache_dirs.len(),
        }
    }
}

impl PoolInner {
    /// Register a new instance and start its launch in the background.
    ///
    /// The record is inserted into `active` here, under the state lock, so
    /// it is visible to concurrent callers and the reaper before the launch
    /// has gone anywhere.
    fn launch_instance(self: &Arc<Self>, state: &mut PoolState) -> Arc<BrowserInstance> {
        let id = state.next_id;
        state.next_id += 1;
        let recycled_dir = if self.recycle_disk_cache {
            state.recycled_cache_dirs.pop_front()
        } else {
            None
        };

        let (tx, rx) = watch::channel(None);
        let instance = Arc::new(BrowserInstance::new(id, rx));
        state.active.insert(id, Arc::clone(&instance));

        info!(id, "launching browser");
        tokio::spawn(run_launch(
            Arc::downgrade(self),
            Arc::clone(&instance),
            tx,
            recycled_dir,
        ));
        instance
    }

    async fn retire_by_id(&self, id: u64) {
        let mut state = self.state.lock().await;
        if let Some(instance) = state.active.remove(&id) {
            debug!(id, "browser retired");
            state.retired.insert(id, instance);
        }
    }

    /// Remove a retired instance and tear it down. A no-op when some other
    /// path already claimed it.
    pub(crate) async fn kill_by_id(self: &Arc<Self>, id: u64) {
        let instance = self.state.lock().await.retired.remove(&id);
        if let Some(instance) = instance {
            self.kill_instance(instance).await;
        }
    }

    async fn kill_instance(self: &Arc<Self>, instance: Arc<BrowserInstance>) {
        // Unconditional hard kill once the grace runs out; recycling is
        // idempotent, so it does not matter which path gets there first.
        let pool = Arc::downgrade(self);
        let timer_instance = Arc::clone(&instance);
        tokio::spawn(async move {
            tokio::time::sleep(PROCESS_KILL_TIMEOUT).await;
            timer_instance.hard_kill();
            if let Some(pool) = pool.upgrade() {
                pool.dispose_cache_dir(&timer_instance).await;
            }
        });

        match instance.browser().await {
            Ok(handle) => {
                if !instance.mark_killed()
                    && let Err(e) = handle.close().await
                {
                    warn!(id = instance.id, "orderly browser close failed: {e:#}");
                }
            }
            Err(_) => {
                // never came up; nothing to close
                instance.mark_killed();
            }
        }
        self.dispose_cache_dir(&instance).await;
    }

    /// Return an instance's cache directory to the recycling queue, or
    /// delete it when the pool is already being destroyed.
    async fn dispose_cache_dir(&self, instance: &BrowserInstance) {
        let Some(dir) = instance.take_cache_dir() else {
            return;
        };
        if self.destroyed.load(Ordering::SeqCst) {
            cache::remove_cache_dir(&dir);
            return;
        }
        debug!(
            id = instance.id,
            "recycling cache directory {}",
            dir.display()
        );
        self.state.lock().await.recycled_cache_dirs.push_back(dir);
    }

    async fn on_disconnected(self: &Arc<Self>, id: u64) {
        let instance = {
            let state = self.state.lock().await;
            state
                .active
                .get(&id)
                .or_else(|| state.retired.get(&id))
                .cloned()
        };
        let Some(instance) = instance else { return };
        if instance.is_killed() {
            // we asked for this one
            return;
        }
        error!(id, "browser disconnected unexpectedly");
        self.retire_by_id(id).await;
    }

    async fn on_target_destroyed(self: &Arc<Self>, id: u64, kind: TargetKind) {
        if !kind.counts_as_page() {
            return;
        }
        let schedule_kill = {
            let state = self.state.lock().await;
            let (instance, retired) = match state.active.get(&id) {
                Some(instance) => (instance, false),
                None => match state.retired.get(&id) {
                    Some(instance) => (instance, true),
                    None => return,
                },
            };
            let remaining = instance.note_page_destroyed();
            retired && remaining == 0
        };
        if schedule_kill {
            debug!(id, "last page gone on retired browser; kill scheduled");
            let pool = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(PAGE_CLOSE_KILL_TIMEOUT).await;
                if let Some(pool) = pool.upgrade() {
                    pool.kill_by_id(id).await;
                }
            });
        }
    }
}

/// Drive one instance's launch to completion and wire up its events.
async fn run_launch(
    pool: Weak<PoolInner>,
    instance: Arc<BrowserInstance>,
    tx: watch::Sender<Option<LaunchOutcome>>,
    recycled_dir: Option<PathBuf>,
) {
    let Some(strong) = pool.upgrade() else { return };
    let launcher = Arc::clone(&strong.launcher);
    // never mutate the caller's options; the clone gets the cache argument
    let mut options = strong.launch_options.clone();
    let recycle = strong.recycle_disk_cache;
    drop(strong);

    let prepared = if recycle {
        match recycled_dir.map_or_else(cache::create_cache_dir, Ok) {
            Ok(dir) => {
                debug!(
                    id = instance.id,
                    "browser gets disk cache {}",
                    dir.display()
                );
                options.args.push(cache::disk_cache_arg(&dir));
                instance.set_cache_dir(dir);
                Ok(())
            }
            Err(e) => Err(e),
        }
    } else {
        Ok(())
    };

    let result = match prepared {
        Ok(()) => launcher.launch(options).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(handle) => {
            if let Some(pid) = handle.process_id() {
                instance.set_child_pid(pid);
            }
            spawn_event_forwarder(pool.clone(), instance.id, handle.events());
            let _ = tx.send(Some(Ok(Arc::clone(&handle))));

            // destroy may have completed while we were launching; the late
            // browser would otherwise outlive the pool
            let destroyed_late = match pool.upgrade() {
                Some(pool) => pool.destroyed.load(Ordering::SeqCst),
                None => true,
            };
            if destroyed_late {
                instance.mark_killed();
                if let Err(e) = handle.close().await {
                    warn!(
                        id = instance.id,
                        "failed to close browser that finished launching after destroy: {e:#}"
                    );
                }
                if let Some(dir) = instance.take_cache_dir() {
                    cache::remove_cache_dir(&dir);
                }
            }
        }
        Err(e) => {
            error!(id = instance.id, "browser launch failed: {e:#}");
            // retire before the waiters wake up, so a caller that sees the
            // error never finds the corpse still active
            if let Some(pool) = pool.upgrade() {
                pool.retire_by_id(instance.id).await;
            }
            let _ = tx.send(Some(Err(Arc::new(e))));
        }
    }
}

/// Translate one browser's event stream into pool state changes.
///
/// The task closes over the instance id, never the record; everything is
/// re-resolved through the pool maps, so the record can be dropped freely.
fn spawn_event_forwarder(
    pool: Weak<PoolInner>,
    id: u64,
    mut events: broadcast::Receiver<BrowserEvent>,
) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(BrowserEvent::Disconnected) => {
                    if let Some(pool) = pool.upgrade() {
                        pool.on_disconnected(id).await;
                    }
                    break;
                }
                Ok(BrowserEvent::TargetDestroyed(kind)) => {
                    let Some(pool) = pool.upgrade() else { break };
                    pool.on_target_destroyed(id, kind).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(id, skipped, "browser event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Emergency teardown on interrupt: one signal per child, straight to the
/// OS. Orphaned children are worse than an untidy shutdown.
async fn interrupt_loop(pool: Weak<PoolInner>) {
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            break;
        }
        let Some(pool) = pool.upgrade() else { break };
        warn!("interrupt received; signalling every browser child");
        let state = pool.state.lock().await;
        for instance in state.active.values().chain(state.retired.values()) {
            instance.signal_interrupt();
        }
    }
}
