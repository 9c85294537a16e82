//! Command-line entry point: acquire the requested products and print them

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use product_harvester::application::{
    ApiTier, BrowserTier, HtmlTier, RecordValidator, SourceOrchestrator, SourceTier,
};
use product_harvester::domain::ProductRef;
use product_harvester::infrastructure::browser_pool::ChromeTabFactory;
use product_harvester::infrastructure::config::TierKind;
use product_harvester::infrastructure::{
    init_logging, ApiProductClient, AppConfig, BrowserPool, CacheStore, ExtractionEngine,
    HttpClient, RetryCoordinator,
};

#[tokio::main]
async fn main() -> Result<()> {
    let inputs: Vec<String> = std::env::args().skip(1).collect();
    if inputs.is_empty() {
        bail!("usage: product-harvester <product id or url>...");
    }

    let config_path = match std::env::var_os("PRODUCT_HARVESTER_CONFIG") {
        Some(path) => path.into(),
        None => AppConfig::default_config_path(),
    };
    let config = AppConfig::load(&config_path).await?;
    init_logging(&config.logging)?;
    info!(path = %config_path.display(), "configuration loaded");

    let mut products = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let product = ProductRef::parse(input)
            .with_context(|| format!("unrecognized product reference: {input}"))?;
        products.push(product);
    }

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling in-flight acquisitions");
                token.cancel();
            }
        });
    }

    let cache = Arc::new(CacheStore::new(config.cache.clone()));
    cache.load().await;
    let flush_task = cache.spawn_flush_task(token.clone());

    let http = Arc::new(HttpClient::new(config.http.clone())?);
    let engine = Arc::new(ExtractionEngine::new(config.extraction.clone()));

    // The browser tier is optional at runtime: without a Chrome binary the
    // remaining tiers still work.
    let browser_pool: Option<Arc<BrowserPool>> = if config
        .orchestrator
        .tiers
        .iter()
        .any(|t| t.kind == TierKind::Browser)
    {
        match ChromeTabFactory::launch(config.browser.profile.clone()) {
            Ok(factory) => Some(Arc::new(BrowserPool::new(factory, config.browser.ceiling))),
            Err(e) => {
                warn!("browser unavailable, skipping browser tier: {e:#}");
                None
            }
        }
    } else {
        None
    };

    let mut tiers: Vec<SourceTier> = Vec::new();
    for tier_config in &config.orchestrator.tiers {
        let source: Arc<dyn product_harvester::application::ProductSource> =
            match tier_config.kind {
                TierKind::Api => Arc::new(ApiTier::new(
                    tier_config.name.clone(),
                    ApiProductClient::new(config.api.clone())
                        .context("failed to construct api client")?,
                )),
                TierKind::Html => Arc::new(HtmlTier::new(
                    tier_config.name.clone(),
                    Arc::clone(&http),
                    Arc::clone(&engine),
                    config.orchestrator.page_url_template.clone(),
                    config.orchestrator.blocked_markers.clone(),
                )),
                TierKind::Browser => match &browser_pool {
                    Some(pool) => Arc::new(BrowserTier::new(
                        tier_config.name.clone(),
                        Arc::clone(pool),
                        Arc::clone(&engine),
                        Duration::from_secs(config.browser.acquire_timeout_secs),
                        config.orchestrator.page_url_template.clone(),
                        config.orchestrator.blocked_markers.clone(),
                    )),
                    None => continue,
                },
            };
        tiers.push(SourceTier {
            name: tier_config.name.clone(),
            source,
            retry: tier_config.retry.clone(),
            cache_ttl: tier_config.cache_ttl_secs.map(Duration::from_secs),
        });
    }
    if tiers.is_empty() {
        bail!("no usable source tiers configured");
    }

    let orchestrator = SourceOrchestrator::new(
        Arc::clone(&cache),
        RetryCoordinator::new(),
        tiers,
        RecordValidator::new(config.orchestrator.validation.clone()),
        config.retry.clone(),
        config.orchestrator.synthetic_fallback,
        config.orchestrator.batch_max_in_flight,
    );

    let results = orchestrator.acquire_batch(products, &token).await;

    let mut failures = 0usize;
    for (product, result) in &results {
        match result {
            Ok(record) => {
                println!("{}", serde_json::to_string_pretty(record)?);
            }
            Err(failure) => {
                failures += 1;
                error!(id = %product.normalized_id(), "{failure}");
            }
        }
    }

    let snapshot = orchestrator.retry().snapshot().await;
    for (class, stats) in snapshot {
        info!(
            class,
            attempts = stats.total_attempts,
            successes = stats.total_successes,
            rate = ?stats.rolling_success_rate,
            "task class summary"
        );
    }

    token.cancel();
    let _ = flush_task.await;
    if let Some(pool) = &browser_pool {
        pool.shutdown().await;
    }

    if failures > 0 {
        bail!("{failures} of {} acquisitions failed", results.len());
    }
    Ok(())
}
