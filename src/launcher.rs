//! Browser launching.
//!
//! [`Launcher`] is the seam between the pool and the machinery that actually
//! produces a connected browser. The default [`ChromiumLauncher`] spawns a
//! Chrome/Chromium child with a DevTools debugging port and attaches to it
//! with chromiumoxide; spawning the process ourselves (rather than letting
//! chromiumoxide do it) keeps the OS child handle available for hard kills
//! and interrupt delivery.

use anyhow::{Context, Result, anyhow};
use chromiumoxide::Browser;
use chromiumoxide::cdp::browser_protocol::inspector::EventTargetCrashed;
use chromiumoxide::cdp::browser_protocol::target::{
    EventTargetCreated, EventTargetDestroyed, SetDiscoverTargetsParams, TargetId,
};
use futures::StreamExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::handle::{BrowserEvent, BrowserHandle, Page, PageHandle, TargetKind};

/// How long to keep retrying the DevTools websocket after spawning Chrome.
const CONNECT_ATTEMPTS: u32 = 20;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Capacity of the per-browser event channel. Slow subscribers lag rather
/// than block the forwarder.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Options for launching one browser.
///
/// The pool clones this record (arguments included) before appending its own
/// directives, so a caller's copy is never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchOptions {
    /// Headless mode. `None` defers to the launcher default (headless).
    pub headless: Option<bool>,
    /// Open DevTools for every tab; implies a headful session.
    pub devtools: bool,
    /// Browser executable override. Discovered on the system when absent.
    pub executable: Option<PathBuf>,
    /// Extra command-line arguments, passed through verbatim.
    pub args: Vec<String>,
    /// Window size for headful sessions.
    pub window_size: Option<(u32, u32)>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: None,
            devtools: false,
            executable: None,
            args: Vec::new(),
            window_size: None,
        }
    }
}

impl LaunchOptions {
    /// Whether these options describe a headful session.
    pub(crate) fn is_headful(&self) -> bool {
        match self.headless {
            Some(headless) => !headless,
            None => self.devtools,
        }
    }
}

/// Factory producing connected browsers from launch options.
pub trait Launcher: Send + Sync {
    fn launch(&self, options: LaunchOptions) -> BoxFuture<'_, Result<Arc<dyn BrowserHandle>>>;
}

/// Default launcher backed by a locally installed Chrome/Chromium.
#[derive(Debug, Default)]
pub struct ChromiumLauncher;

impl Launcher for ChromiumLauncher {
    fn launch(&self, options: LaunchOptions) -> BoxFuture<'_, Result<Arc<dyn BrowserHandle>>> {
        Box::pin(async move {
            let browser = ChromiumBrowser::launch(options).await?;
            Ok(Arc::new(browser) as Arc<dyn BrowserHandle>)
        })
    }
}

/// Find a Chrome/Chromium executable on the system.
///
/// `CHROMIUM_PATH` overrides everything; then well-known install locations;
/// then `which` on Unix.
pub fn find_browser_executable() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("using browser from CHROMIUM_PATH: {}", path.display());
            return Ok(path);
        }
        warn!(
            "CHROMIUM_PATH points to a non-existent file: {}",
            path.display()
        );
    }

    let candidates: &[&str] = if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files\Chromium\Application\chrome.exe",
        ]
    } else if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };

    for candidate in candidates {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("found browser at {}", path.display());
            return Ok(path);
        }
    }

    if !cfg!(target_os = "windows") {
        for cmd in &["chromium", "chromium-browser", "google-chrome", "chrome"] {
            if let Ok(output) = Command::new("which").arg(cmd).output()
                && output.status.success()
            {
                let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !found.is_empty() {
                    let path = PathBuf::from(found);
                    info!("found browser via which: {}", path.display());
                    return Ok(path);
                }
            }
        }
    }

    Err(anyhow!("no Chrome/Chromium executable found"))
}

/// A Chrome child process attached over the DevTools protocol.
pub struct ChromiumBrowser {
    browser: tokio::sync::Mutex<Browser>,
    pid: u32,
    child: std::sync::Mutex<Option<std::process::Child>>,
    user_data_dir: std::sync::Mutex<Option<PathBuf>>,
    events: broadcast::Sender<BrowserEvent>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ChromiumBrowser {
    async fn launch(options: LaunchOptions) -> Result<Self> {
        let executable = match options.executable.clone() {
            Some(path) => path,
            None => find_browser_executable()?,
        };

        let port = pick_debug_port()?;
        let user_data_dir =
            std::env::temp_dir().join(format!("crawlpool_profile_{}", Uuid::new_v4()));
        // create_dir (not create_dir_all) fails on collision rather than
        // silently sharing a profile
        std::fs::create_dir(&user_data_dir)
            .with_context(|| format!("failed to create {}", user_data_dir.display()))?;

        let mut args = vec![
            format!("--remote-debugging-port={port}"),
            format!("--user-data-dir={}", user_data_dir.display()),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            "--mute-audio".to_string(),
        ];
        if !options.is_headful() {
            args.push("--headless=new".to_string());
        }
        if options.devtools {
            args.push("--auto-open-devtools-for-tabs".to_string());
        }
        if let Some((width, height)) = options.window_size {
            args.push(format!("--window-size={width},{height}"));
        }
        args.extend(options.args.iter().cloned());
        args.push("about:blank".to_string());

        debug!("spawning {} on port {port}", executable.display());
        let child = Command::new(&executable)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn {}", executable.display()))?;
        let pid = child.id();

        let (browser, handler) = match connect_with_retry(port).await {
            Ok(connected) => connected,
            Err(e) => {
                // the half-started child would otherwise leak
                let mut child = child;
                let _ = child.kill();
                let _ = std::fs::remove_dir_all(&user_data_dir);
                return Err(e);
            }
        };
        info!(pid, port, "browser up");

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut tasks = Vec::new();

        // Drain chromiumoxide's handler stream; its end means the control
        // connection is gone.
        let disconnect_tx = events.clone();
        let mut handler = handler;
        tasks.push(tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("browser handler error: {e}");
                    break;
                }
            }
            let _ = disconnect_tx.send(BrowserEvent::Disconnected);
        }));

        // Target lifecycle: remember each target's kind on creation so the
        // destroy notification (which only carries an id) can be classified.
        browser
            .execute(
                SetDiscoverTargetsParams::builder()
                    .discover(true)
                    .build()
                    .map_err(|e| anyhow!("failed to build discover-targets params: {e}"))?,
            )
            .await
            .context("failed to enable target discovery")?;
        let created = browser
            .event_listener::<EventTargetCreated>()
            .await
            .context("failed to subscribe to target creation")?;
        let destroyed = browser
            .event_listener::<EventTargetDestroyed>()
            .await
            .context("failed to subscribe to target destruction")?;
        let target_tx = events.clone();
        tasks.push(tokio::spawn(async move {
            let mut created = created.fuse();
            let mut destroyed = destroyed.fuse();
            let mut kinds: HashMap<TargetId, TargetKind> = HashMap::new();
            loop {
                tokio::select! {
                    Some(event) = created.next() => {
                        let info = &event.target_info;
                        kinds.insert(
                            info.target_id.clone(),
                            TargetKind::from_protocol(info.r#type.as_str()),
                        );
                    }
                    Some(event) = destroyed.next() => {
                        let kind = kinds
                            .remove(&event.target_id)
                            .unwrap_or(TargetKind::Other);
                        let _ = target_tx.send(BrowserEvent::TargetDestroyed(kind));
                    }
                    else => break,
                }
            }
        }));

        Ok(Self {
            browser: tokio::sync::Mutex::new(browser),
            pid,
            child: std::sync::Mutex::new(Some(child)),
            user_data_dir: std::sync::Mutex::new(Some(user_data_dir)),
            events,
            tasks: std::sync::Mutex::new(tasks),
        })
    }

    fn cleanup_user_data_dir(&self) {
        let dir = self.user_data_dir.lock().expect("lock poisoned").take();
        if let Some(dir) = dir
            && let Err(e) = std::fs::remove_dir_all(&dir)
        {
            warn!("failed to remove profile directory {}: {e}", dir.display());
        }
    }
}

impl BrowserHandle for ChromiumBrowser {
    fn new_page(&self) -> BoxFuture<'_, Result<Page>> {
        Box::pin(async move {
            let browser = self.browser.lock().await;
            let page = browser
                .new_page("about:blank")
                .await
                .context("failed to open page")?;
            Ok(Arc::new(ChromiumPage { page }) as Page)
        })
    }

    fn pages(&self) -> BoxFuture<'_, Result<Vec<Page>>> {
        Box::pin(async move {
            let browser = self.browser.lock().await;
            let pages = browser.pages().await.context("failed to list pages")?;
            Ok(pages
                .into_iter()
                .map(|page| Arc::new(ChromiumPage { page }) as Page)
                .collect())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut browser = self.browser.lock().await;
            browser.close().await.context("failed to close browser")?;
            let _ = browser.wait().await;
            drop(browser);
            for task in self.tasks.lock().expect("lock poisoned").drain(..) {
                task.abort();
            }
            // reap the child now that Chrome has exited
            if let Some(mut child) = self.child.lock().expect("lock poisoned").take() {
                let _ = child.try_wait();
            }
            self.cleanup_user_data_dir();
            Ok(())
        })
    }

    fn process_id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn events(&self) -> broadcast::Receiver<BrowserEvent> {
        self.events.subscribe()
    }
}

impl Drop for ChromiumBrowser {
    fn drop(&mut self) {
        for task in self.tasks.lock().expect("lock poisoned").drain(..) {
            task.abort();
        }
        self.cleanup_user_data_dir();
    }
}

#[derive(Debug)]
struct ChromiumPage {
    page: chromiumoxide::Page,
}

impl PageHandle for ChromiumPage {
    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.page
                .clone()
                .close()
                .await
                .context("failed to close page")?;
            Ok(())
        })
    }

    fn crashed(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            match self.page.event_listener::<EventTargetCrashed>().await {
                Ok(mut crashes) => crashes.next().await.is_some(),
                Err(_) => false,
            }
        })
    }
}

async fn connect_with_retry(
    port: u16,
) -> Result<(Browser, chromiumoxide::handler::Handler)> {
    let url = format!("http://127.0.0.1:{port}");
    let mut last_err = None;
    for attempt in 0..CONNECT_ATTEMPTS {
        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
        match Browser::connect(&url).await {
            Ok(connected) => return Ok(connected),
            Err(e) => {
                debug!("devtools not ready (attempt {attempt}): {e}");
                last_err = Some(e);
            }
        }
    }
    Err(anyhow!(
        "browser did not open its devtools port: {}",
        last_err.map_or_else(|| "unknown".to_string(), |e| e.to_string())
    ))
}

/// Ask the OS for a free TCP port to use as the debugging port.
fn pick_debug_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .context("failed to probe for a free debugging port")?;
    Ok(listener.local_addr()?.port())
}
