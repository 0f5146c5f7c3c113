//! Error types surfaced by the browser pool.
//!
//! Only `new_page` reports failures to callers; retirement, reaping and
//! destruction log and swallow internally.

/// Errors returned to `new_page` callers.
///
/// Launch and page-creation failures are transient from the caller's point
/// of view: the offending browser has already been retired and a retry will
/// be served by a different instance.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool has been destroyed; no further pages will be created.
    #[error("browser pool has been destroyed")]
    Destroyed,

    /// The browser selected for this page failed to launch.
    #[error("browser launch failed: {0}")]
    LaunchFailed(String),

    /// The browser was up but refused to open a new page.
    #[error("failed to open page: {0}")]
    PageCreationFailed(String),
}

impl PoolError {
    pub(crate) fn launch(err: &anyhow::Error) -> Self {
        // {:#} preserves the full context chain
        Self::LaunchFailed(format!("{err:#}"))
    }

    pub(crate) fn page_creation(err: &anyhow::Error) -> Self {
        Self::PageCreationFailed(format!("{err:#}"))
    }
}
