//! Tiered acquisition: cache first, then each source tier under retry
//!
//! The orchestrator owns the whole acquisition story for one product: serve
//! from cache when a fresh validated record exists, otherwise walk the
//! configured tiers in priority order, retrying each under its policy, and
//! validate whatever comes back before it is cached or returned. When every
//! tier fails the caller gets an itemized failure naming each tier's reason;
//! fabricated data is never substituted unless explicitly opted into.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::tiers::ProductSource;
use crate::domain::errors::{AcquireError, AcquisitionFailure, StopReason, TierFailure};
use crate::domain::product::{ProductRecord, ProductRef, SourceTag};
use crate::infrastructure::cache::CacheStore;
use crate::infrastructure::config::ValidationConfig;
use crate::infrastructure::retry::{RetryCoordinator, RetryPolicy};

/// Data-quality gate between extraction and the caller. A record that fails
/// here is treated like a tier failure: the next tier gets its chance.
pub struct RecordValidator {
    config: ValidationConfig,
}

impl RecordValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self, record: &ProductRecord) -> Result<(), AcquireError> {
        let title = record.title.trim();
        if title.len() < self.config.min_title_len {
            return Err(AcquireError::validation(format!(
                "title too short: {title:?}"
            )));
        }
        let lowered = title.to_lowercase();
        if self.config.generic_titles.iter().any(|g| g.to_lowercase() == lowered) {
            return Err(AcquireError::validation(format!(
                "generic placeholder title: {title:?}"
            )));
        }

        if record.price <= 0.0 {
            return Err(AcquireError::validation(format!(
                "non-positive price: {}",
                record.price
            )));
        }
        // Cent-exact comparison: sentinels are known fabricated defaults, and
        // 15.99 vs 15.990001 must not slip past the check.
        let cents = (record.price * 100.0).round() as i64;
        if let Some(sentinel) = self
            .config
            .placeholder_sentinels
            .iter()
            .find(|s| (**s * 100.0).round() as i64 == cents)
        {
            return Err(AcquireError::validation(format!(
                "placeholder sentinel price: {sentinel}"
            )));
        }

        Ok(())
    }
}

/// One tier as the orchestrator sees it: a source plus its overrides.
pub struct SourceTier {
    pub name: String,
    pub source: Arc<dyn ProductSource>,
    pub retry: Option<RetryPolicy>,
    pub cache_ttl: Option<Duration>,
}

/// Walks the tier ladder for each requested product.
pub struct SourceOrchestrator {
    cache: Arc<CacheStore>,
    retry: RetryCoordinator,
    tiers: Vec<SourceTier>,
    validator: RecordValidator,
    default_policy: RetryPolicy,
    synthetic_fallback: bool,
    batch_max_in_flight: usize,
}

impl SourceOrchestrator {
    pub fn new(
        cache: Arc<CacheStore>,
        retry: RetryCoordinator,
        tiers: Vec<SourceTier>,
        validator: RecordValidator,
        default_policy: RetryPolicy,
        synthetic_fallback: bool,
        batch_max_in_flight: usize,
    ) -> Self {
        Self {
            cache,
            retry,
            tiers,
            validator,
            default_policy,
            synthetic_fallback,
            batch_max_in_flight: batch_max_in_flight.max(1),
        }
    }

    pub fn retry(&self) -> &RetryCoordinator {
        &self.retry
    }

    /// Acquire one product: cache, then each tier in order.
    ///
    /// A validated record from any tier ends the walk; the cached copy is
    /// tagged as cache-sourced so repeated acquisitions within the TTL return
    /// identical records. Fatal tier errors (bad credentials, broken config)
    /// skip straight to the next tier without burning retry attempts.
    pub async fn acquire(
        &self,
        product: &ProductRef,
        token: &CancellationToken,
    ) -> Result<ProductRecord, AcquisitionFailure> {
        let id = product.normalized_id();

        if let Some(hit) = self.cache.get(id).await {
            debug!(id, "serving product from cache");
            return Ok(hit);
        }

        let mut tried: Vec<TierFailure> = Vec::new();
        let mut cancelled = false;

        for tier in &self.tiers {
            if token.is_cancelled() {
                tried.push(TierFailure {
                    tier: tier.name.clone(),
                    reason: "operation cancelled".to_string(),
                });
                cancelled = true;
                break;
            }

            let class = format!("tier:{}", tier.name);
            let policy = tier.retry.as_ref().unwrap_or(&self.default_policy);
            info!(id, tier = %tier.name, "trying source tier");

            let outcome = self
                .retry
                .execute(&class, policy, token, |_| tier.source.fetch(product, token))
                .await;

            match outcome {
                Ok(partial) => {
                    if partial.is_empty() {
                        tried.push(TierFailure {
                            tier: tier.name.clone(),
                            reason: "tier returned an empty record".to_string(),
                        });
                        continue;
                    }
                    let record = partial.into_record(id, SourceTag::Tier(tier.name.clone()));
                    match self.validator.validate(&record) {
                        Ok(()) => {
                            let mut cached = record.clone();
                            cached.source_tag = SourceTag::Cache;
                            self.cache.set(id, cached, tier.cache_ttl).await;
                            info!(id, tier = %tier.name, "✅ product acquired");
                            return Ok(record);
                        }
                        Err(err) => {
                            warn!(id, tier = %tier.name, error = %err, "record rejected by validation");
                            tried.push(TierFailure {
                                tier: tier.name.clone(),
                                reason: err.to_string(),
                            });
                        }
                    }
                }
                Err(err) => {
                    warn!(id, tier = %tier.name, error = %err, "tier exhausted");
                    cancelled = err.stop == StopReason::Cancelled;
                    tried.push(TierFailure {
                        tier: tier.name.clone(),
                        reason: err.to_string(),
                    });
                    if cancelled {
                        break;
                    }
                }
            }
        }

        // A cancelled walk did not exhaust the tiers; a placeholder would
        // misreport it as an outcome.
        if self.synthetic_fallback && !cancelled {
            warn!(id, "every tier failed, emitting synthetic placeholder record");
            return Ok(self.synthetic_record(id));
        }

        Err(AcquisitionFailure {
            product_id: id.to_string(),
            tried,
        })
    }

    /// Opt-in placeholder for callers that prefer a tagged stand-in over a
    /// failure. Unmistakably synthetic and never written to the cache.
    fn synthetic_record(&self, id: &str) -> ProductRecord {
        use crate::domain::product::PartialRecord;
        PartialRecord {
            title: Some(format!("Product {id}")),
            ..Default::default()
        }
        .into_record(id, SourceTag::Synthetic)
    }

    /// Acquire a batch concurrently, bounded by the configured in-flight
    /// ceiling. Results keep their input association; order is completion
    /// order.
    pub async fn acquire_batch(
        &self,
        products: Vec<ProductRef>,
        token: &CancellationToken,
    ) -> Vec<(ProductRef, Result<ProductRecord, AcquisitionFailure>)> {
        stream::iter(products)
            .map(|product| async move {
                let result = self.acquire(&product, token).await;
                (product, result)
            })
            .buffer_unordered(self.batch_max_in_flight)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::product::PartialRecord;

    fn validator() -> RecordValidator {
        RecordValidator::new(ValidationConfig::default())
    }

    fn record(title: &str, price: f64) -> ProductRecord {
        PartialRecord {
            title: Some(title.to_string()),
            price: Some(price),
            ..Default::default()
        }
        .into_record("42", SourceTag::Tier("html".into()))
    }

    #[test]
    fn accepts_a_plausible_record() {
        assert!(validator().validate(&record("Wireless Mouse", 12.49)).is_ok());
    }

    #[test]
    fn rejects_sentinel_prices_cent_exactly() {
        let v = validator();
        assert!(v.validate(&record("Wireless Mouse", 29.99)).is_err());
        // Float noise within a cent still matches the sentinel.
        assert!(v.validate(&record("Wireless Mouse", 29.990000001)).is_err());
        // A cent away is a legitimate price.
        assert!(v.validate(&record("Wireless Mouse", 29.98)).is_ok());
    }

    #[test]
    fn sentinel_list_is_configuration_not_hardcoded() {
        let v = RecordValidator::new(ValidationConfig {
            placeholder_sentinels: vec![29.99],
            ..Default::default()
        });
        // 15.99 is only suspicious when configured as a sentinel.
        assert!(v.validate(&record("Wireless Mouse", 15.99)).is_ok());
    }

    #[test]
    fn rejects_non_positive_prices() {
        let v = validator();
        assert!(v.validate(&record("Wireless Mouse", 0.0)).is_err());
        assert!(v.validate(&record("Wireless Mouse", -4.5)).is_err());
    }

    #[test]
    fn rejects_generic_and_too_short_titles() {
        let v = validator();
        assert!(v.validate(&record("Product", 12.49)).is_err());
        assert!(v.validate(&record("untitled", 12.49)).is_err());
        assert!(v.validate(&record("ab", 12.49)).is_err());
    }

    #[test]
    fn synthetic_records_are_unmistakably_tagged() {
        let orchestrator = SourceOrchestrator::new(
            Arc::new(CacheStore::new(Default::default())),
            RetryCoordinator::new(),
            Vec::new(),
            validator(),
            RetryPolicy::default(),
            true,
            1,
        );
        let synthetic = orchestrator.synthetic_record("42");
        assert_eq!(synthetic.source_tag, SourceTag::Synthetic);
        assert_eq!(synthetic.price, 0.0);
    }
}
