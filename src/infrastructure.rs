//! Infrastructure layer: transport clients, browser pool, cache, retry,
//! extraction, configuration, and logging

pub mod api_client;
pub mod browser_pool;
pub mod cache;
pub mod config;
pub mod extraction;
pub mod http_client;
pub mod logging;
pub mod retry;

pub use api_client::{ApiClientConfig, ApiProductClient};
pub use browser_pool::{
    BrowserPool, BrowserPoolConfig, BrowserProfile, BrowserSlot, ChromeTabFactory, PoolStats,
    SlotFactory, SlotPool,
};
pub use cache::{CacheConfig, CacheEntry, CacheStore};
pub use config::{
    AppConfig, LoggingConfig, OrchestratorConfig, TierConfig, TierKind, ValidationConfig,
};
pub use extraction::{ExtractionConfig, ExtractionEngine};
pub use http_client::{HttpClient, HttpClientConfig};
pub use logging::init_logging;
pub use retry::{RetryCoordinator, RetryPolicy, RetrySession};
