//! Per-browser bookkeeping.

use anyhow::anyhow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

use crate::handle::BrowserHandle;

/// Result of a launch, shared between every waiter on the instance.
pub(crate) type LaunchOutcome = Result<Arc<dyn BrowserHandle>, Arc<anyhow::Error>>;

/// One browser under pool management.
///
/// The record exists from the moment the launch is scheduled; the browser
/// handle itself settles later through the watch channel. Counters are
/// atomics because event forwarders, the reaper and page allocations all
/// hold the record through an `Arc`.
pub(crate) struct BrowserInstance {
    pub(crate) id: u64,
    browser_rx: watch::Receiver<Option<LaunchOutcome>>,
    active_pages: AtomicUsize,
    total_pages: AtomicUsize,
    last_page_opened_at: Mutex<Instant>,
    killed: AtomicBool,
    child_pid: OnceLock<u32>,
    cache_dir: Mutex<Option<PathBuf>>,
}

impl BrowserInstance {
    pub(crate) fn new(id: u64, browser_rx: watch::Receiver<Option<LaunchOutcome>>) -> Self {
        Self {
            id,
            browser_rx,
            active_pages: AtomicUsize::new(0),
            total_pages: AtomicUsize::new(0),
            last_page_opened_at: Mutex::new(Instant::now()),
            killed: AtomicBool::new(false),
            child_pid: OnceLock::new(),
            cache_dir: Mutex::new(None),
        }
    }

    /// Wait for the launch to settle and return the handle.
    pub(crate) async fn browser(&self) -> LaunchOutcome {
        let mut rx = self.browser_rx.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(Arc::new(anyhow!("browser launch never settled")));
            }
        }
    }

    /// The settled launch outcome, or `None` while still launching.
    pub(crate) fn browser_if_ready(&self) -> Option<LaunchOutcome> {
        self.browser_rx.borrow().clone()
    }

    /// Account for a page allocation. Returns the new lifetime total.
    ///
    /// Called with the pool state lock held, before any await, so that a
    /// concurrent allocation observes the updated counters.
    pub(crate) fn note_page_opened(&self) -> usize {
        *self.last_page_opened_at.lock().expect("lock poisoned") = Instant::now();
        self.active_pages.fetch_add(1, Ordering::SeqCst);
        self.total_pages.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Account for a destroyed page target. Returns the remaining count.
    pub(crate) fn note_page_destroyed(&self) -> usize {
        let previous = self
            .active_pages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            });
        match previous {
            Ok(previous) => previous - 1,
            // already zero; a non-pool tab went away
            Err(_) => 0,
        }
    }

    pub(crate) fn active_pages(&self) -> usize {
        self.active_pages.load(Ordering::SeqCst)
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_page_opened_at
            .lock()
            .expect("lock poisoned")
            .elapsed()
    }

    /// Flag the instance as being torn down. Returns whether it already was.
    pub(crate) fn mark_killed(&self) -> bool {
        self.killed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_child_pid(&self, pid: u32) {
        let _ = self.child_pid.set(pid);
    }

    pub(crate) fn set_cache_dir(&self, dir: PathBuf) {
        *self.cache_dir.lock().expect("lock poisoned") = Some(dir);
    }

    /// Take ownership of the cache directory, once.
    ///
    /// Both the orderly-close path and the hard-kill timer call this; the
    /// second caller gets `None`, which makes recycling idempotent.
    pub(crate) fn take_cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir.lock().expect("lock poisoned").take()
    }

    /// Deliver an interrupt to the browser child. No-op without a pid.
    pub(crate) fn signal_interrupt(&self) {
        if let Some(&pid) = self.child_pid.get() {
            debug!(id = self.id, pid, "interrupting browser child");
            signal_pid(pid, InterruptClass::Interrupt);
        }
    }

    /// Hard-kill the browser child. No-op without a pid.
    pub(crate) fn hard_kill(&self) {
        if let Some(&pid) = self.child_pid.get() {
            debug!(id = self.id, pid, "hard-killing browser child");
            signal_pid(pid, InterruptClass::Kill);
        }
    }
}

enum InterruptClass {
    Interrupt,
    Kill,
}

#[cfg(unix)]
fn signal_pid(pid: u32, class: InterruptClass) {
    let signal = match class {
        InterruptClass::Interrupt => libc::SIGINT,
        InterruptClass::Kill => libc::SIGKILL,
    };
    // the child may already be gone; any error is uninteresting
    unsafe {
        libc::kill(pid as i32, signal);
    }
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _class: InterruptClass) {
    // No reliable out-of-band signal delivery; the orderly close and the
    // process exit sweep cover these platforms.
}
