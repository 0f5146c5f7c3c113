//! crawlpool: a dynamically-sized pool of headless Chrome browsers for
//! web crawling.
//!
//! The pool multiplexes page requests over a bounded browser fleet and
//! retires browsers after a bounded amount of use. Disk-cache directories
//! can be recycled across browser generations to save bandwidth, and every
//! child process is guaranteed to be torn down on destroy or interrupt.
//!
//! ```no_run
//! use crawlpool::{BrowserPool, PoolConfig};
//!
//! # async fn run() -> Result<(), crawlpool::PoolError> {
//! let pool = BrowserPool::new(PoolConfig::default());
//! let page = pool.new_page().await?;
//! // drive the page, then let it go
//! drop(page);
//! pool.destroy().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod handle;
pub mod launcher;
pub mod pool;

pub use error::PoolError;
pub use handle::{BrowserEvent, BrowserHandle, Page, PageHandle, TargetKind};
pub use launcher::{ChromiumLauncher, LaunchOptions, Launcher, find_browser_executable};
pub use pool::{BrowserPool, PoolConfig, PoolConfigBuilder, PoolStats};
