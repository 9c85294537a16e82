//! Error taxonomy for the acquisition pipeline
//!
//! Every failure the pipeline can produce is classified here as either
//! recoverable (worth retrying within a tier) or fatal (abort the tier
//! immediately). Validation failures are neither: the orchestrator absorbs
//! them by advancing to the next source tier.

use serde::Serialize;
use thiserror::Error;

/// A single failure the pipeline can encounter while acquiring a product.
#[derive(Error, Debug, Clone)]
pub enum AcquireError {
    #[error("network error: {reason}")]
    Network { reason: String },

    #[error("blocked by anti-bot challenge: {marker}")]
    Blocked { marker: String },

    #[error("record failed validation: {reason}")]
    Validation { reason: String },

    #[error("browser pool exhausted")]
    PoolExhausted,

    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error("unrecognized product reference: {input}")]
    InvalidRef { input: String },

    #[error("document parsing failed: {reason}")]
    Parse { reason: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl AcquireError {
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    pub fn blocked(marker: impl Into<String>) -> Self {
        Self::Blocked {
            marker: marker.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    /// Whether the retry coordinator may attempt the same tier again.
    ///
    /// Validation and cancellation are handled above the retry layer and are
    /// therefore not retried here either.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Blocked { .. } | Self::PoolExhausted | Self::Parse { .. }
        )
    }
}

/// Why a retry loop stopped handing the task back for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// The last error was fatal; retrying would not help.
    Fatal,
    /// The attempt budget of the policy is spent.
    AttemptsExhausted,
    /// The rolling success rate for this task class fell below the floor.
    CircuitOpen,
    /// The caller cancelled the operation.
    Cancelled,
}

/// Terminal outcome of a retried task: the last error plus the stop reason.
#[derive(Error, Debug, Clone)]
#[error("{class}: gave up after {attempts} attempt(s) [{stop:?}]: {source}")]
pub struct RetryError {
    pub class: String,
    pub attempts: u32,
    pub stop: StopReason,
    pub source: AcquireError,
}

/// One tier's reason for not producing a usable record.
#[derive(Debug, Clone, Serialize)]
pub struct TierFailure {
    pub tier: String,
    pub reason: String,
}

/// Returned when every configured source tier has been exhausted.
///
/// The pipeline never substitutes synthetic data for a real result; this
/// itemized failure is the honest alternative.
#[derive(Debug, Clone, Serialize)]
pub struct AcquisitionFailure {
    pub product_id: String,
    pub tried: Vec<TierFailure>,
}

impl std::fmt::Display for AcquisitionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "acquisition of product {} failed after {} tier(s)",
            self.product_id,
            self.tried.len()
        )?;
        for failure in &self.tried {
            write!(f, "; {}: {}", failure.tier, failure.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for AcquisitionFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverability_classification() {
        assert!(AcquireError::network("timeout").is_recoverable());
        assert!(AcquireError::blocked("captcha").is_recoverable());
        assert!(AcquireError::PoolExhausted.is_recoverable());
        assert!(AcquireError::parse("truncated html").is_recoverable());

        assert!(!AcquireError::config("missing credentials").is_recoverable());
        assert!(!AcquireError::validation("placeholder price").is_recoverable());
        assert!(!AcquireError::Cancelled.is_recoverable());
        assert!(!AcquireError::InvalidRef {
            input: "garbage".into()
        }
        .is_recoverable());
    }

    #[test]
    fn acquisition_failure_lists_every_tier() {
        let failure = AcquisitionFailure {
            product_id: "1005001234".into(),
            tried: vec![
                TierFailure {
                    tier: "api".into(),
                    reason: "configuration error: api credentials not configured".into(),
                },
                TierFailure {
                    tier: "html".into(),
                    reason: "network error: timeout".into(),
                },
            ],
        };

        let rendered = failure.to_string();
        assert!(rendered.contains("1005001234"));
        assert!(rendered.contains("api:"));
        assert!(rendered.contains("html:"));
    }
}
