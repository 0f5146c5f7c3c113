//! Pool configuration.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::launcher::{ChromiumLauncher, LaunchOptions, Launcher};

/// Configuration for [`BrowserPool`](super::BrowserPool).
#[derive(Clone)]
pub struct PoolConfig {
    /// Hard cap on concurrent pages per browser. A saturated browser is
    /// skipped at selection time; when every browser is saturated a new one
    /// is launched.
    pub max_open_pages_per_instance: usize,
    /// Lifetime page cap per browser; crossing it retires the instance.
    pub retire_instance_after_page_count: usize,
    /// Period of the background reaper.
    pub instance_killer_interval: Duration,
    /// Maximum time a retired instance may sit idle before a forced kill.
    pub kill_instance_after: Duration,
    /// Factory producing connected browsers.
    pub launcher: Arc<dyn Launcher>,
    /// Options handed to the launcher. Cloned before the pool appends its
    /// own arguments.
    pub launch_options: LaunchOptions,
    /// Reuse disk-cache directories across browser generations.
    pub recycle_disk_cache: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open_pages_per_instance: 50,
            retire_instance_after_page_count: 100,
            instance_killer_interval: Duration::from_secs(60),
            kill_instance_after: Duration::from_secs(300),
            launcher: Arc::new(ChromiumLauncher),
            launch_options: LaunchOptions::default(),
            recycle_disk_cache: false,
        }
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field(
                "max_open_pages_per_instance",
                &self.max_open_pages_per_instance,
            )
            .field(
                "retire_instance_after_page_count",
                &self.retire_instance_after_page_count,
            )
            .field("instance_killer_interval", &self.instance_killer_interval)
            .field("kill_instance_after", &self.kill_instance_after)
            .field("launch_options", &self.launch_options)
            .field("recycle_disk_cache", &self.recycle_disk_cache)
            .finish_non_exhaustive()
    }
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }

    /// Whether recycling can actually be honored for this session.
    ///
    /// Chromium does not persist its disk cache in headless sessions, so a
    /// headless launch (explicit, or implied by leaving headless unset
    /// without devtools) downgrades recycling to off with a warning.
    pub(crate) fn effective_recycle_disk_cache(&self) -> bool {
        if !self.recycle_disk_cache {
            return false;
        }
        if self.launch_options.is_headful() {
            return true;
        }
        warn!(
            "disk cache recycling is not supported for headless browsers; \
             disabling it for this pool"
        );
        false
    }
}

/// Builder for [`PoolConfig`].
#[derive(Default)]
pub struct PoolConfigBuilder {
    max_open_pages_per_instance: Option<usize>,
    retire_instance_after_page_count: Option<usize>,
    abort_instance_after_page_count: Option<usize>,
    instance_killer_interval: Option<Duration>,
    kill_instance_after: Option<Duration>,
    launcher: Option<Arc<dyn Launcher>>,
    launch_options: Option<LaunchOptions>,
    recycle_disk_cache: bool,
}

impl PoolConfigBuilder {
    pub fn max_open_pages_per_instance(mut self, count: usize) -> Self {
        self.max_open_pages_per_instance = Some(count);
        self
    }

    pub fn retire_instance_after_page_count(mut self, count: usize) -> Self {
        self.retire_instance_after_page_count = Some(count);
        self
    }

    /// Former name of [`Self::retire_instance_after_page_count`]; honored
    /// only when the current name is not set.
    #[deprecated(note = "use retire_instance_after_page_count")]
    pub fn abort_instance_after_page_count(mut self, count: usize) -> Self {
        self.abort_instance_after_page_count = Some(count);
        self
    }

    pub fn instance_killer_interval(mut self, interval: Duration) -> Self {
        self.instance_killer_interval = Some(interval);
        self
    }

    pub fn kill_instance_after(mut self, after: Duration) -> Self {
        self.kill_instance_after = Some(after);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn launch_options(mut self, options: LaunchOptions) -> Self {
        self.launch_options = Some(options);
        self
    }

    pub fn recycle_disk_cache(mut self, recycle: bool) -> Self {
        self.recycle_disk_cache = recycle;
        self
    }

    pub fn build(self) -> PoolConfig {
        let defaults = PoolConfig::default();
        let retire_instance_after_page_count = match (
            self.retire_instance_after_page_count,
            self.abort_instance_after_page_count,
        ) {
            (Some(count), None) => count,
            (Some(count), Some(_)) => {
                warn!(
                    "both retire_instance_after_page_count and the deprecated \
                     abort_instance_after_page_count are set; using the former"
                );
                count
            }
            (None, Some(count)) => {
                warn!(
                    "abort_instance_after_page_count is deprecated; \
                     use retire_instance_after_page_count"
                );
                count
            }
            (None, None) => defaults.retire_instance_after_page_count,
        };
        PoolConfig {
            max_open_pages_per_instance: self
                .max_open_pages_per_instance
                .unwrap_or(defaults.max_open_pages_per_instance),
            retire_instance_after_page_count,
            instance_killer_interval: self
                .instance_killer_interval
                .unwrap_or(defaults.instance_killer_interval),
            kill_instance_after: self
                .kill_instance_after
                .unwrap_or(defaults.kill_instance_after),
            launcher: self.launcher.unwrap_or(defaults.launcher),
            launch_options: self.launch_options.unwrap_or(defaults.launch_options),
            recycle_disk_cache: self.recycle_disk_cache,
        }
    }
}
