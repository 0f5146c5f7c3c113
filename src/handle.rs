//! Contracts the pool consumes from the browser layer.
//!
//! The pool never talks to Chrome directly; it drives launched browsers
//! through [`BrowserHandle`] and hands callers [`PageHandle`]s. The default
//! chromiumoxide-backed implementations live in [`crate::launcher`]; tests
//! substitute mocks.

use anyhow::Result;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A page handed out by the pool.
pub type Page = Arc<dyn PageHandle>;

/// Lifecycle events emitted by a running browser.
#[derive(Debug, Clone)]
pub enum BrowserEvent {
    /// The control connection dropped; the browser is gone.
    Disconnected,
    /// A target (tab, worker, ...) was destroyed.
    TargetDestroyed(TargetKind),
}

/// Kind of a browser target, as reported by target lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Page,
    BackgroundPage,
    ServiceWorker,
    Browser,
    Webview,
    Other,
}

impl TargetKind {
    /// Map a DevTools-protocol target type string.
    pub fn from_protocol(kind: &str) -> Self {
        match kind {
            "page" => Self::Page,
            "background_page" => Self::BackgroundPage,
            "service_worker" => Self::ServiceWorker,
            "browser" => Self::Browser,
            "webview" => Self::Webview,
            _ => Self::Other,
        }
    }

    /// Whether destroying a target of this kind frees a page slot.
    ///
    /// Only `page` and `other` targets are attributed to page counters;
    /// workers and background pages come and go on their own.
    pub fn counts_as_page(self) -> bool {
        matches!(self, Self::Page | Self::Other)
    }
}

/// A connected browser under pool control.
///
/// Implementations must keep the residual blank tab alive from launch until
/// close, so a `pages()` listing of length one means "no real work left".
pub trait BrowserHandle: Send + Sync {
    /// Open a fresh page.
    fn new_page(&self) -> BoxFuture<'_, Result<Page>>;

    /// List all currently open pages, including the residual blank tab.
    fn pages(&self) -> BoxFuture<'_, Result<Vec<Page>>>;

    /// Ask the browser to shut down in an orderly way.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    /// OS process id of the browser child, when known.
    fn process_id(&self) -> Option<u32>;

    /// Subscribe to lifecycle events.
    fn events(&self) -> broadcast::Receiver<BrowserEvent>;
}

/// A single navigable page.
pub trait PageHandle: Send + Sync + std::fmt::Debug {
    /// Close the page.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    /// Resolves `true` if the page dies of a fatal error, `false` once the
    /// page goes away without one.
    fn crashed(&self) -> BoxFuture<'_, bool>;
}

/// Identity comparison for trait-object browser handles.
///
/// `retire` matches browsers by identity, not equality; comparing the data
/// pointers sidesteps vtable-address instability for fat pointers.
pub(crate) fn same_handle(a: &Arc<dyn BrowserHandle>, b: &Arc<dyn BrowserHandle>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
