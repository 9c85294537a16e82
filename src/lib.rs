//! product-harvester: resilient multi-source marketplace product acquisition
//!
//! Acquires structured product records from a marketplace through a ladder of
//! source tiers (structured API, plain HTML fetch, rendered headless-browser
//! page) with per-tier retry policies, a circuit breaker, a TTL-keyed record
//! cache, and a bounded browser-tab pool. Records are validated before they
//! are cached or returned; when every tier fails the caller receives an
//! itemized failure rather than fabricated data.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use product_harvester::domain::ProductRef;
//! use product_harvester::application::{RecordValidator, SourceOrchestrator};
//! use product_harvester::infrastructure::{AppConfig, CacheStore, RetryCoordinator};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = AppConfig::default();
//! let orchestrator = SourceOrchestrator::new(
//!     Arc::new(CacheStore::new(config.cache.clone())),
//!     RetryCoordinator::new(),
//!     Vec::new(),
//!     RecordValidator::new(config.orchestrator.validation.clone()),
//!     config.retry.clone(),
//!     config.orchestrator.synthetic_fallback,
//!     config.orchestrator.batch_max_in_flight,
//! );
//! let product = ProductRef::parse("1005001234567890")?;
//! let record = orchestrator
//!     .acquire(&product, &CancellationToken::new())
//!     .await?;
//! println!("{}", record.title);
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{SourceOrchestrator, SourceTier};
pub use domain::{AcquireError, AcquisitionFailure, ProductRecord, ProductRef, SourceTag};
pub use infrastructure::{AppConfig, CacheStore, RetryCoordinator, RetryPolicy};
