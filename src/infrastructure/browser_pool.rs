//! Bounded pool of headless-browser tabs with acquire/release semantics
//!
//! Slots are created lazily up to a configured ceiling and handed to one
//! in-flight request at a time. The invariant `acquired + free == created
//! <= ceiling` holds at all times. Slot creation is behind the `SlotFactory`
//! seam so the pool logic is testable without a Chrome binary.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Network;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::AcquireError;

/// Anti-detection browser configuration, kept as data rather than scattered
/// per call site: spoofed automation properties, realistic headers, and the
/// resource types blocked for speed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserProfile {
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    pub extra_headers: Vec<(String, String)>,
    /// URL patterns blocked via CDP before any navigation (images, fonts,
    /// media) so page loads stay cheap.
    pub blocked_url_patterns: Vec<String>,
    /// Script evaluated on every fresh tab to mask headless markers.
    pub stealth_script: String,
    pub navigation_timeout_secs: u64,
    pub headless: bool,
}

impl Default for BrowserProfile {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
                .to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            platform: "Win32".to_string(),
            extra_headers: vec![
                ("Accept".to_string(), "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string()),
                ("Upgrade-Insecure-Requests".to_string(), "1".to_string()),
            ],
            blocked_url_patterns: vec![
                "*.png".to_string(),
                "*.jpg".to_string(),
                "*.jpeg".to_string(),
                "*.gif".to_string(),
                "*.webp".to_string(),
                "*.svg".to_string(),
                "*.woff".to_string(),
                "*.woff2".to_string(),
                "*.mp4".to_string(),
            ],
            stealth_script: r#"
                Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
                Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
                Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
                window.chrome = window.chrome || { runtime: {} };
            "#
            .to_string(),
            navigation_timeout_secs: 30,
            headless: true,
        }
    }
}

/// Pool sizing and wait behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserPoolConfig {
    /// Maximum number of concurrently live tabs.
    pub ceiling: usize,
    /// How long an acquire may wait before reporting pool exhaustion.
    pub acquire_timeout_secs: u64,
    pub profile: BrowserProfile,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            ceiling: 3,
            acquire_timeout_secs: 60,
            profile: BrowserProfile::default(),
        }
    }
}

/// Creates and destroys pool slots. The real implementation drives Chrome;
/// tests substitute a stub.
#[async_trait]
pub trait SlotFactory: Send + Sync {
    type Slot: Send;

    async fn create(&self) -> Result<Self::Slot, AcquireError>;
    async fn destroy(&self, slot: Self::Slot);
}

struct PoolState<S> {
    free: Vec<S>,
    created: usize,
}

/// Point-in-time pool counters; `acquired + free == created` always.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub created: usize,
    pub free: usize,
    pub acquired: usize,
    pub ceiling: usize,
}

/// Generic bounded slot pool: free list plus created count behind a mutex,
/// waiters woken through a `Notify`.
pub struct SlotPool<F: SlotFactory> {
    factory: F,
    ceiling: usize,
    state: Mutex<PoolState<F::Slot>>,
    released: Notify,
}

impl<F: SlotFactory> SlotPool<F> {
    pub fn new(factory: F, ceiling: usize) -> Self {
        Self {
            factory,
            ceiling: ceiling.max(1),
            state: Mutex::new(PoolState {
                free: Vec::new(),
                created: 0,
            }),
            released: Notify::new(),
        }
    }

    /// Acquire a slot: pop a free one, create one if below the ceiling,
    /// otherwise wait until a release.
    pub async fn acquire(&self) -> Result<F::Slot, AcquireError> {
        loop {
            let may_create = {
                let mut state = self.state.lock().await;
                if let Some(slot) = state.free.pop() {
                    debug!(free = state.free.len(), created = state.created, "reusing pooled slot");
                    return Ok(slot);
                }
                if state.created < self.ceiling {
                    // Reserve the slot before the (slow) creation happens
                    // outside the lock.
                    state.created += 1;
                    true
                } else {
                    false
                }
            };

            if may_create {
                match self.factory.create().await {
                    Ok(slot) => return Ok(slot),
                    Err(err) => {
                        let mut state = self.state.lock().await;
                        state.created -= 1;
                        drop(state);
                        self.released.notify_one();
                        // Slot creation failure is fatal at this layer; retry
                        // policy belongs to whoever wraps the pool.
                        return Err(err);
                    }
                }
            }

            self.released.notified().await;
        }
    }

    /// Acquire with an upper wait bound; elapsing reports pool exhaustion,
    /// which the retry layer treats as recoverable.
    pub async fn acquire_timeout(&self, limit: Duration) -> Result<F::Slot, AcquireError> {
        match tokio::time::timeout(limit, self.acquire()).await {
            Ok(result) => result,
            Err(_) => Err(AcquireError::PoolExhausted),
        }
    }

    /// Return a slot. If the free list already holds ceiling-many slots the
    /// slot is destroyed instead of retained, keeping steady-state resource
    /// usage bounded.
    pub async fn release(&self, slot: F::Slot) {
        let surplus = {
            let mut state = self.state.lock().await;
            if state.free.len() >= self.ceiling {
                state.created = state.created.saturating_sub(1);
                Some(slot)
            } else {
                state.free.push(slot);
                None
            }
        };
        if let Some(slot) = surplus {
            self.factory.destroy(slot).await;
        }
        self.released.notify_one();
    }

    /// Destroy a slot instead of returning it, for holders that can no
    /// longer vouch for its state. Frees capacity and wakes a waiter.
    pub async fn discard(&self, slot: F::Slot) {
        {
            let mut state = self.state.lock().await;
            state.created = state.created.saturating_sub(1);
        }
        self.factory.destroy(slot).await;
        self.released.notify_one();
    }

    /// Destroy every free slot and wake all waiters. Busy slots are destroyed
    /// by their holders on release after shutdown.
    pub async fn shutdown(&self) {
        let drained = {
            let mut state = self.state.lock().await;
            let drained: Vec<F::Slot> = state.free.drain(..).collect();
            state.created = state.created.saturating_sub(drained.len());
            drained
        };
        info!(count = drained.len(), "shutting down pool, destroying free slots");
        for slot in drained {
            self.factory.destroy(slot).await;
        }
        self.released.notify_waiters();
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            created: state.created,
            free: state.free.len(),
            acquired: state.created - state.free.len(),
            ceiling: self.ceiling,
        }
    }
}

/// One live browser tab owned by at most one in-flight request.
pub struct BrowserSlot {
    pub id: Uuid,
    pub created_at: Instant,
    tab: Arc<Tab>,
}

impl BrowserSlot {
    pub fn tab(&self) -> Arc<Tab> {
        Arc::clone(&self.tab)
    }
}

/// Launches one shared Chrome process and mints configured tabs as slots.
#[derive(Clone)]
pub struct ChromeTabFactory {
    browser: Arc<Browser>,
    profile: BrowserProfile,
}

impl ChromeTabFactory {
    /// Launch the shared browser process. Blocking; call during startup.
    pub fn launch(profile: BrowserProfile) -> Result<Self> {
        let args: Vec<&OsStr> = vec![
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--no-first-run"),
            OsStr::new("--disable-gpu"),
            OsStr::new("--disable-dev-shm-usage"),
        ];

        let options = LaunchOptions::default_builder()
            .headless(profile.headless)
            // The default 30s idle timeout closes the CDP WebSocket during
            // long navigations.
            .idle_browser_timeout(Duration::from_secs(3600))
            .args(args)
            .build()
            .map_err(|e| anyhow!("failed to build browser launch options: {e}"))?;

        info!(headless = profile.headless, "launching shared browser process");
        let browser = Browser::new(options).context("failed to launch browser process")?;

        Ok(Self {
            browser: Arc::new(browser),
            profile,
        })
    }

    /// Open and configure one tab. Blocking; run inside `spawn_blocking`.
    fn init_tab(&self) -> Result<Arc<Tab>> {
        let tab = self.browser.new_tab().context("failed to open browser tab")?;
        tab.set_default_timeout(Duration::from_secs(self.profile.navigation_timeout_secs));

        tab.set_user_agent(
            &self.profile.user_agent,
            Some(&self.profile.accept_language),
            Some(&self.profile.platform),
        )
        .context("failed to override user agent")?;

        if !self.profile.extra_headers.is_empty() {
            let headers: HashMap<&str, &str> = self
                .profile
                .extra_headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            tab.set_extra_http_headers(headers)
                .context("failed to set request headers")?;
        }

        if !self.profile.blocked_url_patterns.is_empty() {
            tab.call_method(Network::Enable {
                max_total_buffer_size: None,
                max_resource_buffer_size: None,
                max_post_data_size: None,
                enable_durable_messages: None,
                report_direct_socket_traffic: None,
            })
            .context("failed to enable network domain")?;
            tab.call_method(Network::SetBlockedURLs {
                urls: self.profile.blocked_url_patterns.clone(),
            })
            .context("failed to install resource block list")?;
        }

        if !self.profile.stealth_script.trim().is_empty() {
            tab.evaluate(&self.profile.stealth_script, false)
                .context("failed to apply stealth script")?;
        }

        Ok(tab)
    }
}

#[async_trait]
impl SlotFactory for ChromeTabFactory {
    type Slot = BrowserSlot;

    async fn create(&self) -> Result<BrowserSlot, AcquireError> {
        let factory = self.clone();
        let tab = tokio::task::spawn_blocking(move || factory.init_tab())
            .await
            .map_err(|e| AcquireError::config(format!("browser task panicked: {e}")))?
            .map_err(|e| AcquireError::config(format!("{e:#}")))?;

        let slot = BrowserSlot {
            id: Uuid::new_v4(),
            created_at: Instant::now(),
            tab,
        };
        info!(slot_id = %slot.id, "created browser slot");
        Ok(slot)
    }

    async fn destroy(&self, slot: BrowserSlot) {
        debug!(slot_id = %slot.id, age_secs = slot.created_at.elapsed().as_secs(), "destroying browser slot");
        let tab = slot.tab;
        let result = tokio::task::spawn_blocking(move || tab.close(true)).await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("failed to close browser tab: {e:#}"),
            Err(e) => warn!("browser close task panicked: {e}"),
        }
    }
}

/// The production pool type: Chrome tabs behind the generic slot pool.
pub type BrowserPool = SlotPool<ChromeTabFactory>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubFactory {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        fail: bool,
    }

    impl StubFactory {
        fn new() -> Self {
            Self {
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl SlotFactory for StubFactory {
        type Slot = usize;

        async fn create(&self) -> Result<usize, AcquireError> {
            if self.fail {
                return Err(AcquireError::config("no browser available"));
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn destroy(&self, _slot: usize) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn creates_lazily_up_to_ceiling() {
        let pool = SlotPool::new(StubFactory::new(), 2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.created, 2);
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.free, 0);

        pool.release(a).await;
        pool.release(b).await;
        let stats = pool.stats().await;
        assert_eq!(stats.created, 2);
        assert_eq!(stats.free, 2);
        assert_eq!(stats.acquired, 0);
    }

    #[tokio::test]
    async fn invariant_holds_through_acquire_release_cycles() {
        let pool = Arc::new(SlotPool::new(StubFactory::new(), 3));

        for _ in 0..5 {
            let s1 = pool.acquire().await.unwrap();
            let s2 = pool.acquire().await.unwrap();
            let stats = pool.stats().await;
            assert_eq!(stats.acquired + stats.free, stats.created);
            assert!(stats.created <= stats.ceiling);
            pool.release(s1).await;
            pool.release(s2).await;
        }

        let stats = pool.stats().await;
        assert_eq!(stats.acquired + stats.free, stats.created);
        assert!(stats.created <= 3);
    }

    #[tokio::test]
    async fn waiter_is_woken_by_release() {
        let pool = Arc::new(SlotPool::new(StubFactory::new(), 1));
        let slot = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        // Give the waiter a chance to park.
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(slot).await;

        let reused = waiter.await.unwrap().unwrap();
        pool.release(reused).await;
        let stats = pool.stats().await;
        assert_eq!(stats.created, 1);
    }

    #[tokio::test]
    async fn discarded_slot_is_destroyed_not_pooled() {
        let pool = Arc::new(SlotPool::new(StubFactory::new(), 1));
        let slot = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A holder that cancelled mid-use cannot vouch for the slot; it must
        // be destroyed, never offered to the waiting acquirer.
        pool.discard(slot).await;
        assert_eq!(pool.factory.destroyed.load(Ordering::SeqCst), 1);

        // Capacity is freed, so the waiter gets a freshly created slot.
        let fresh = waiter.await.unwrap().unwrap();
        pool.release(fresh).await;
        let stats = pool.stats().await;
        assert_eq!(stats.created, 1);
        assert_eq!(stats.free, 1);
        assert_eq!(pool.factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn acquire_timeout_reports_pool_exhaustion() {
        let pool = SlotPool::new(StubFactory::new(), 1);
        let _held = pool.acquire().await.unwrap();

        let err = pool
            .acquire_timeout(Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::PoolExhausted));
    }

    #[tokio::test]
    async fn failed_creation_releases_the_reservation() {
        let factory = StubFactory {
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            fail: true,
        };
        let pool = SlotPool::new(factory, 1);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, AcquireError::Config { .. }));

        let stats = pool.stats().await;
        assert_eq!(stats.created, 0, "reservation must roll back on failure");
    }

    #[tokio::test]
    async fn shutdown_destroys_free_slots() {
        let pool = SlotPool::new(StubFactory::new(), 2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a).await;
        pool.release(b).await;

        pool.shutdown().await;
        let stats = pool.stats().await;
        assert_eq!(stats.created, 0);
        assert_eq!(stats.free, 0);
        assert_eq!(pool.factory.destroyed.load(Ordering::SeqCst), 2);
    }
}
