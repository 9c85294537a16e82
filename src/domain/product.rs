//! Product entities: references, validated records and partial extractions

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::errors::AcquireError;

/// Ordered URL patterns for pulling a numeric product id out of a
/// marketplace URL. First pattern that matches wins.
static REF_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"/item/(\d+)\.html",
        r"/item/(\d+)",
        r"/product/(\d+)",
        r"[?&]productId=(\d+)",
        r"[?&]id=(\d+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static ref pattern"))
    .collect()
});

/// Opaque product identity plus the URL it was derived from.
///
/// Created once per acquisition request and discarded afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRef {
    pub id: String,
    pub url: Option<String>,
}

impl ProductRef {
    /// Parse a bare numeric id or a marketplace product URL.
    pub fn parse(input: &str) -> Result<Self, AcquireError> {
        let trimmed = input.trim();
        if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Ok(Self {
                id: trimmed.to_string(),
                url: None,
            });
        }
        for pattern in REF_PATTERNS.iter() {
            if let Some(caps) = pattern.captures(trimmed) {
                return Ok(Self {
                    id: caps[1].to_string(),
                    url: Some(trimmed.to_string()),
                });
            }
        }
        Err(AcquireError::InvalidRef {
            input: trimmed.to_string(),
        })
    }

    /// Identity used for cache keys and record ids.
    pub fn normalized_id(&self) -> &str {
        &self.id
    }
}

/// Star rating on the 0..=5 scale, or explicitly unknown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Known(f64),
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    Available,
    OutOfStock,
    Unknown,
}

/// Provenance of a returned record. `Synthetic` exists only for the opt-in
/// fallback and is never emitted otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Cache,
    Tier(String),
    Synthetic,
}

/// A validated product record as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: String,
    pub title: String,
    pub price: f64,
    pub currency: Option<String>,
    pub rating: Rating,
    pub review_count: Option<u32>,
    pub stock: StockStatus,
    pub seller: Option<String>,
    pub images: Vec<String>,
    pub source_tag: SourceTag,
    pub acquired_at: DateTime<Utc>,
}

/// Extraction output: every field is either a concrete value pulled from the
/// document or absent. The extraction engine never fabricates a value; the
/// orchestrator decides whether a partial record is good enough.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialRecord {
    pub title: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub stock: Option<StockStatus>,
    pub seller: Option<String>,
    pub images: Vec<String>,
}

impl PartialRecord {
    /// True when not a single field was extracted.
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.price.is_none()
            && self.currency.is_none()
            && self.rating.is_none()
            && self.review_count.is_none()
            && self.stock.is_none()
            && self.seller.is_none()
            && self.images.is_empty()
    }

    /// Promote the partial extraction into a full record with provenance.
    /// Missing fields become their explicit unknown forms; validation of the
    /// result is the orchestrator's job.
    pub fn into_record(self, id: &str, source_tag: SourceTag) -> ProductRecord {
        ProductRecord {
            id: id.to_string(),
            title: self.title.unwrap_or_default(),
            price: self.price.unwrap_or(0.0),
            currency: self.currency,
            rating: match self.rating {
                Some(value) => Rating::Known(value),
                None => Rating::Unknown,
            },
            review_count: self.review_count,
            stock: self.stock.unwrap_or(StockStatus::Unknown),
            seller: self.seller,
            images: self.images,
            source_tag,
            acquired_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_numeric_id() {
        let r = ProductRef::parse("1005007773110632").unwrap();
        assert_eq!(r.id, "1005007773110632");
        assert!(r.url.is_none());
    }

    #[test]
    fn parses_item_html_url() {
        let r = ProductRef::parse("https://www.example.com/item/1005001234567890.html").unwrap();
        assert_eq!(r.id, "1005001234567890");
        assert!(r.url.as_deref().unwrap().contains("/item/"));
    }

    #[test]
    fn parses_query_parameter_urls() {
        let r = ProductRef::parse("https://shop.example.com/detail?productId=44332211").unwrap();
        assert_eq!(r.id, "44332211");

        let r = ProductRef::parse("https://shop.example.com/view?id=998877").unwrap();
        assert_eq!(r.id, "998877");
    }

    #[test]
    fn first_matching_pattern_wins() {
        // Path id outranks the query parameter because of pattern order.
        let r = ProductRef::parse("https://www.example.com/item/111.html?id=222").unwrap();
        assert_eq!(r.id, "111");
    }

    #[test]
    fn rejects_unrecognized_input() {
        let err = ProductRef::parse("https://www.example.com/help/contact").unwrap_err();
        assert!(matches!(err, AcquireError::InvalidRef { .. }));
        assert!(ProductRef::parse("").is_err());
    }

    #[test]
    fn partial_record_promotion_fills_unknowns() {
        let partial = PartialRecord {
            title: Some("Wireless Mouse".into()),
            price: Some(12.5),
            ..Default::default()
        };
        let record = partial.into_record("42", SourceTag::Tier("html".into()));
        assert_eq!(record.id, "42");
        assert_eq!(record.rating, Rating::Unknown);
        assert_eq!(record.stock, StockStatus::Unknown);
        assert!(record.currency.is_none());
        assert_eq!(record.source_tag, SourceTag::Tier("html".into()));
    }

    #[test]
    fn empty_partial_is_detected() {
        assert!(PartialRecord::default().is_empty());
        let partial = PartialRecord {
            seller: Some("Acme Store".into()),
            ..Default::default()
        };
        assert!(!partial.is_empty());
    }
}
