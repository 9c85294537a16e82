//! Application configuration: every knob of the pipeline, overridable
//!
//! One JSON file holds the whole tree. A missing file is replaced with the
//! defaults (and written back so the knobs are discoverable); a corrupt file
//! is a hard error since silently falling back would hide typos.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::infrastructure::api_client::ApiClientConfig;
use crate::infrastructure::browser_pool::BrowserPoolConfig;
use crate::infrastructure::cache::CacheConfig;
use crate::infrastructure::extraction::ExtractionConfig;
use crate::infrastructure::http_client::HttpClientConfig;
use crate::infrastructure::retry::RetryPolicy;

/// Which fetch mechanism a tier uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// Authenticated structured API call.
    Api,
    /// Plain HTTP GET plus extraction.
    Html,
    /// Headless-browser render plus extraction.
    Browser,
}

/// One configured source tier, tried in list order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub kind: TierKind,
    /// Overrides the global retry policy for this tier.
    pub retry: Option<RetryPolicy>,
    /// Overrides the default cache TTL for records this tier produced.
    pub cache_ttl_secs: Option<u64>,
}

/// Data-quality rules applied before a record is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Known fabricated/default prices to reject (cent-exact match).
    pub placeholder_sentinels: Vec<f64>,
    /// Titles that mean "no real title was extracted".
    pub generic_titles: Vec<String>,
    pub min_title_len: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            placeholder_sentinels: vec![29.99, 15.99, 19.99, 9.99],
            generic_titles: vec![
                "product".to_string(),
                "default title".to_string(),
                "untitled".to_string(),
                "item".to_string(),
                "new product".to_string(),
                "unknown title".to_string(),
            ],
            min_title_len: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Priority-ordered source tiers, cheapest and most reliable first.
    pub tiers: Vec<TierConfig>,
    pub validation: ValidationConfig,
    /// Page URL template (with `{id}`) for refs given as bare ids.
    pub page_url_template: String,
    /// Phrases that identify an anti-bot challenge page.
    pub blocked_markers: Vec<String>,
    /// Maximum concurrent acquisitions in a batch.
    pub batch_max_in_flight: usize,
    /// Opt-in: when every tier fails, return a distinctly tagged synthetic
    /// record instead of a failure. Never enabled silently.
    pub synthetic_fallback: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                TierConfig {
                    name: "api".to_string(),
                    kind: TierKind::Api,
                    retry: None,
                    // API results are cheap to refresh but also stable;
                    // cache them longer than scraped ones.
                    cache_ttl_secs: Some(7200),
                },
                TierConfig {
                    name: "html".to_string(),
                    kind: TierKind::Html,
                    retry: None,
                    cache_ttl_secs: None,
                },
                TierConfig {
                    name: "browser".to_string(),
                    kind: TierKind::Browser,
                    retry: None,
                    cache_ttl_secs: Some(1800),
                },
            ],
            validation: ValidationConfig::default(),
            page_url_template: "https://www.example-marketplace.com/item/{id}.html".to_string(),
            blocked_markers: vec![
                "captcha".to_string(),
                "verify you are human".to_string(),
                "unusual traffic".to_string(),
                "security check".to_string(),
                "slide to verify".to_string(),
                "access denied".to_string(),
            ],
            batch_max_in_flight: 4,
            synthetic_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// "error", "warn", "info", "debug" or "trace".
    pub level: String,
    pub console_output: bool,
    pub file_output: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_output: true,
            file_output: false,
            log_dir: None,
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub retry: RetryPolicy,
    pub http: HttpClientConfig,
    pub api: ApiClientConfig,
    pub browser: BrowserPoolConfig,
    pub cache: CacheConfig,
    pub extraction: ExtractionConfig,
    pub orchestrator: OrchestratorConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Default location: `<config dir>/product-harvester/config.json`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("product-harvester")
            .join("config.json")
    }

    /// Load the configuration, writing the defaults on first run.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                let config: Self = serde_json::from_str(&raw)
                    .with_context(|| format!("config file {} is not valid", path.display()))?;
                Ok(config)
            }
            Err(_) => {
                info!(path = %path.display(), "no config file found, writing defaults");
                let config = Self::default();
                config.save(path).await?;
                Ok(config)
            }
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create config dir {}", parent.display()))?;
        }
        let serialized =
            serde_json::to_string_pretty(self).context("failed to serialize config")?;
        tokio::fs::write(path, serialized)
            .await
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tier_order_is_api_then_html_then_browser() {
        let config = AppConfig::default();
        let kinds: Vec<TierKind> = config.orchestrator.tiers.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TierKind::Api, TierKind::Html, TierKind::Browser]);
    }

    #[test]
    fn partial_config_files_fill_in_defaults() {
        let raw = r#"{ "retry": { "max_attempts": 7 } }"#;
        let config: AppConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.backoff_multiplier, 2.0);
        assert!(!config.orchestrator.synthetic_fallback);
    }

    #[tokio::test]
    async fn load_writes_defaults_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = AppConfig::load(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(config.orchestrator.tiers.len(), 3);

        // Second load reads the file that was just written.
        let reloaded = AppConfig::load(&path).await.unwrap();
        assert_eq!(reloaded.orchestrator.tiers.len(), 3);
    }

    #[tokio::test]
    async fn corrupt_config_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        assert!(AppConfig::load(&path).await.is_err());
    }

    #[test]
    fn roundtrips_through_json() {
        let config = AppConfig::default();
        let raw = serde_json::to_string(&config).unwrap();
        let back: AppConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.orchestrator.tiers.len(), config.orchestrator.tiers.len());
        assert_eq!(back.cache.default_ttl_secs, config.cache.default_ttl_secs);
    }
}
