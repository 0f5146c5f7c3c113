//! Mock launcher, browser and page implementations for pool tests.
//!
//! The mocks honor the browser contract the pool relies on: a residual
//! blank tab is always reported by `pages()`, closing a page emits a
//! page-target destruction event, and closing the browser emits
//! `Disconnected`.

use anyhow::{Result, anyhow};
use crawlpool::{BrowserEvent, BrowserHandle, LaunchOptions, Launcher, Page, PageHandle, TargetKind};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// A scripted browser factory recording every launch.
pub struct MockLauncher {
    browsers: Mutex<Vec<Arc<MockBrowser>>>,
    options_seen: Mutex<Vec<LaunchOptions>>,
    fail_next: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

#[allow(dead_code)]
impl MockLauncher {
    pub fn new() -> Self {
        Self {
            browsers: Mutex::new(Vec::new()),
            options_seen: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
            delay: Mutex::new(None),
        }
    }

    /// Make the next launch fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Delay every launch by the given duration.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn launch_count(&self) -> usize {
        self.browsers.lock().unwrap().len()
    }

    pub fn browser(&self, index: usize) -> Arc<MockBrowser> {
        Arc::clone(&self.browsers.lock().unwrap()[index])
    }

    /// The `index`-th launched browser as the trait object the pool holds.
    pub fn handle(&self, index: usize) -> Arc<dyn BrowserHandle> {
        self.browser(index)
    }

    /// Options the `index`-th launch was invoked with.
    pub fn options(&self, index: usize) -> LaunchOptions {
        self.options_seen.lock().unwrap()[index].clone()
    }
}

impl Launcher for MockLauncher {
    fn launch(&self, options: LaunchOptions) -> BoxFuture<'_, Result<Arc<dyn BrowserHandle>>> {
        Box::pin(async move {
            self.options_seen.lock().unwrap().push(options);
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(anyhow!("scripted launch failure"));
            }
            let browser = MockBrowser::new();
            self.browsers.lock().unwrap().push(Arc::clone(&browser));
            Ok(browser as Arc<dyn BrowserHandle>)
        })
    }
}

/// An in-memory browser with scriptable failure modes.
pub struct MockBrowser {
    pages: Mutex<Vec<Arc<MockPage>>>,
    events: broadcast::Sender<BrowserEvent>,
    closed: AtomicBool,
    total_pages_opened: AtomicUsize,
    fail_new_page: AtomicBool,
    self_weak: Weak<MockBrowser>,
}

#[allow(dead_code)]
impl MockBrowser {
    fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new_cyclic(|self_weak| Self {
            pages: Mutex::new(Vec::new()),
            events,
            closed: AtomicBool::new(false),
            total_pages_opened: AtomicUsize::new(0),
            fail_new_page: AtomicBool::new(false),
            self_weak: self_weak.clone(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pages opened through the pool that are still open.
    pub fn open_page_count(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    /// The `index`-th still-open page, for scripting its fate.
    pub fn page_handle(&self, index: usize) -> Arc<MockPage> {
        Arc::clone(&self.pages.lock().unwrap()[index])
    }

    /// Lifetime count of pages this browser has opened.
    pub fn total_pages_opened(&self) -> usize {
        self.total_pages_opened.load(Ordering::SeqCst)
    }

    /// Make future `new_page` calls fail.
    pub fn fail_new_page(&self) {
        self.fail_new_page.store(true, Ordering::SeqCst);
    }

    /// Simulate an unsolicited browser death announcement.
    pub fn emit_disconnected(&self) {
        let _ = self.events.send(BrowserEvent::Disconnected);
    }

    /// Emit an arbitrary target destruction.
    pub fn emit_target_destroyed(&self, kind: TargetKind) {
        let _ = self.events.send(BrowserEvent::TargetDestroyed(kind));
    }

    /// Remove a page from the listing without emitting any event, as if it
    /// had never existed. Lets tests exercise the reaper's own listing scan
    /// rather than the event-driven kill path.
    pub fn drop_page_silently(&self) {
        self.pages.lock().unwrap().pop();
    }

    fn remove_page(&self, page: &MockPage) {
        let mut pages = self.pages.lock().unwrap();
        pages.retain(|candidate| !std::ptr::eq(Arc::as_ptr(candidate), page));
        drop(pages);
        let _ = self
            .events
            .send(BrowserEvent::TargetDestroyed(TargetKind::Page));
    }
}

impl BrowserHandle for MockBrowser {
    fn new_page(&self) -> BoxFuture<'_, Result<Page>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(anyhow!("browser is closed"));
            }
            if self.fail_new_page.load(Ordering::SeqCst) {
                return Err(anyhow!("scripted page-creation failure"));
            }
            let page = MockPage::attached(self.self_weak.clone());
            self.pages.lock().unwrap().push(Arc::clone(&page));
            self.total_pages_opened.fetch_add(1, Ordering::SeqCst);
            Ok(page as Page)
        })
    }

    fn pages(&self) -> BoxFuture<'_, Result<Vec<Page>>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(anyhow!("browser is closed"));
            }
            // the residual blank tab is always present
            let mut all: Vec<Page> = vec![MockPage::detached()];
            all.extend(
                self.pages
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|page| Arc::clone(page) as Page),
            );
            Ok(all)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::SeqCst) {
                for page in self.pages.lock().unwrap().drain(..) {
                    page.resolve_fate(false);
                }
                let _ = self.events.send(BrowserEvent::Disconnected);
            }
            Ok(())
        })
    }

    fn process_id(&self) -> Option<u32> {
        // no OS child behind a mock; the pool treats hard kills as no-ops
        None
    }

    fn events(&self) -> broadcast::Receiver<BrowserEvent> {
        self.events.subscribe()
    }
}

/// A page whose fate (crashed or just gone) can be scripted.
#[derive(Debug)]
pub struct MockPage {
    browser: Weak<MockBrowser>,
    fate_tx: watch::Sender<Option<bool>>,
    fate_rx: watch::Receiver<Option<bool>>,
}

#[allow(dead_code)]
impl MockPage {
    fn attached(browser: Weak<MockBrowser>) -> Arc<Self> {
        let (fate_tx, fate_rx) = watch::channel(None);
        Arc::new(Self {
            browser,
            fate_tx,
            fate_rx,
        })
    }

    fn detached() -> Page {
        let (fate_tx, fate_rx) = watch::channel(None);
        Arc::new(Self {
            browser: Weak::new(),
            fate_tx,
            fate_rx,
        })
    }

    /// Simulate a fatal page error.
    pub fn crash(&self) {
        let _ = self.fate_tx.send(Some(true));
    }

    fn resolve_fate(&self, crashed: bool) {
        let _ = self.fate_tx.send(Some(crashed));
    }
}

impl PageHandle for MockPage {
    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.resolve_fate(false);
            if let Some(browser) = self.browser.upgrade() {
                browser.remove_page(self);
            }
            Ok(())
        })
    }

    fn crashed(&self) -> BoxFuture<'_, bool> {
        let mut rx = self.fate_rx.clone();
        Box::pin(async move {
            loop {
                if let Some(fate) = *rx.borrow_and_update() {
                    return fate;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
    }
}

/// Identity of a page trait object, for distinctness assertions.
#[allow(dead_code)]
pub fn page_identity(page: &Page) -> *const () {
    Arc::as_ptr(page) as *const ()
}
