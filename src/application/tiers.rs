//! Source tiers: the interchangeable ways of fetching one product
//!
//! Every tier answers the same question ("give me whatever fields you can
//! find for this product") through the `ProductSource` seam, so the
//! orchestrator can walk them in priority order without knowing whether an
//! API call, a plain fetch, or a rendered page produced the data.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::errors::AcquireError;
use crate::domain::product::{PartialRecord, ProductRef};
use crate::infrastructure::api_client::ApiProductClient;
use crate::infrastructure::browser_pool::BrowserPool;
use crate::infrastructure::extraction::ExtractionEngine;
use crate::infrastructure::http_client::HttpClient;

/// One way of fetching product data. Implementations never fabricate fields;
/// whatever cannot be found stays absent in the partial record.
#[async_trait]
pub trait ProductSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(
        &self,
        product: &ProductRef,
        token: &CancellationToken,
    ) -> Result<PartialRecord, AcquireError>;
}

/// Case-insensitive scan for anti-bot challenge phrases. Returns the first
/// marker found so the block reason is visible in logs and failures.
pub fn detect_blocked(html: &str, markers: &[String]) -> Option<String> {
    let lowered = html.to_lowercase();
    markers
        .iter()
        .find(|marker| lowered.contains(&marker.to_lowercase()))
        .cloned()
}

fn page_url(product: &ProductRef, template: &str) -> String {
    match &product.url {
        Some(url) => url.clone(),
        None => template.replace("{id}", product.normalized_id()),
    }
}

/// Structured-API tier, the cheapest and most trustworthy source.
pub struct ApiTier {
    name: String,
    client: ApiProductClient,
}

impl ApiTier {
    pub fn new(name: impl Into<String>, client: ApiProductClient) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }
}

#[async_trait]
impl ProductSource for ApiTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        product: &ProductRef,
        token: &CancellationToken,
    ) -> Result<PartialRecord, AcquireError> {
        self.client.fetch(product.normalized_id(), token).await
    }
}

/// Plain HTTP fetch plus extraction. Works as long as the marketplace still
/// embeds its bootstrap state in the initial document.
pub struct HtmlTier {
    name: String,
    http: Arc<HttpClient>,
    engine: Arc<ExtractionEngine>,
    page_url_template: String,
    blocked_markers: Vec<String>,
}

impl HtmlTier {
    pub fn new(
        name: impl Into<String>,
        http: Arc<HttpClient>,
        engine: Arc<ExtractionEngine>,
        page_url_template: impl Into<String>,
        blocked_markers: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            http,
            engine,
            page_url_template: page_url_template.into(),
            blocked_markers,
        }
    }
}

#[async_trait]
impl ProductSource for HtmlTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        product: &ProductRef,
        token: &CancellationToken,
    ) -> Result<PartialRecord, AcquireError> {
        let url = page_url(product, &self.page_url_template);
        let html = self.http.get_text(&url, token).await?;

        if let Some(marker) = detect_blocked(&html, &self.blocked_markers) {
            warn!(url, marker, "anti-bot challenge page detected");
            return Err(AcquireError::blocked(marker));
        }

        let record = self.engine.parse(&html);
        if record.is_empty() {
            return Err(AcquireError::parse(format!(
                "no product fields extracted from {url}"
            )));
        }
        Ok(record)
    }
}

/// Rendered-page tier: drives a pooled headless-browser tab for pages that
/// only materialize their product data after script execution.
pub struct BrowserTier {
    name: String,
    pool: Arc<BrowserPool>,
    engine: Arc<ExtractionEngine>,
    acquire_timeout: Duration,
    page_url_template: String,
    blocked_markers: Vec<String>,
}

impl BrowserTier {
    pub fn new(
        name: impl Into<String>,
        pool: Arc<BrowserPool>,
        engine: Arc<ExtractionEngine>,
        acquire_timeout: Duration,
        page_url_template: impl Into<String>,
        blocked_markers: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            pool,
            engine,
            acquire_timeout,
            page_url_template: page_url_template.into(),
            blocked_markers,
        }
    }

    async fn render(&self, url: &str, token: &CancellationToken) -> Result<String, AcquireError> {
        let slot = self.pool.acquire_timeout(self.acquire_timeout).await?;
        debug!(slot_id = %slot.id, url, "rendering page in pooled tab");

        let tab = slot.tab();
        let target = url.to_string();
        let navigation = tokio::task::spawn_blocking(move || -> Result<String, AcquireError> {
            tab.navigate_to(&target)
                .map_err(|e| AcquireError::network(format!("navigation failed: {e:#}")))?;
            tab.wait_until_navigated()
                .map_err(|e| AcquireError::network(format!("page load failed: {e:#}")))?;
            tab.get_content()
                .map_err(|e| AcquireError::network(format!("failed to read page content: {e:#}")))
        });

        let outcome = tokio::select! {
            joined = navigation => match joined {
                Ok(result) => result,
                Err(e) => Err(AcquireError::network(format!("browser task panicked: {e}"))),
            },
            _ = token.cancelled() => Err(AcquireError::Cancelled),
        };

        match outcome {
            Err(AcquireError::Cancelled) => {
                // The abandoned navigation task still owns the tab; it must
                // never reach the free list where another request could grab
                // it mid-navigation.
                self.pool.discard(slot).await;
                Err(AcquireError::Cancelled)
            }
            other => {
                // The slot goes back even on failure; a broken tab surfaces
                // as a navigation error on its next use and the pool
                // replaces it then.
                self.pool.release(slot).await;
                other
            }
        }
    }
}

#[async_trait]
impl ProductSource for BrowserTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        product: &ProductRef,
        token: &CancellationToken,
    ) -> Result<PartialRecord, AcquireError> {
        let url = page_url(product, &self.page_url_template);
        let html = self.render(&url, token).await?;

        if let Some(marker) = detect_blocked(&html, &self.blocked_markers) {
            warn!(url, marker, "anti-bot challenge page detected after render");
            return Err(AcquireError::blocked(marker));
        }

        let record = self.engine.parse(&html);
        if record.is_empty() {
            return Err(AcquireError::parse(format!(
                "no product fields extracted from rendered {url}"
            )));
        }
        Ok(record)
    }
}
