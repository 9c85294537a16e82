//! Authenticated structured-API source tier client
//!
//! The cheapest and most reliable tier: a JSON product endpoint behind an
//! app key. Credential acquisition is out of scope; the key arrives through
//! configuration and its absence is a fatal configuration error, surfaced
//! without retry.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::errors::AcquireError;
use crate::domain::product::{PartialRecord, StockStatus};
use crate::infrastructure::http_client::classify_reqwest_error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiClientConfig {
    /// Product endpoint with an `{id}` placeholder.
    pub endpoint_template: String,
    pub app_key: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            endpoint_template: "https://api.example-marketplace.com/v2/products/{id}".to_string(),
            app_key: None,
            timeout_seconds: 15,
        }
    }
}

pub struct ApiProductClient {
    client: Client,
    config: ApiClientConfig,
}

impl ApiProductClient {
    pub fn new(config: ApiClientConfig) -> Result<Self, AcquireError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| AcquireError::config(format!("failed to build api client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Fetch structured product data for `id`.
    pub async fn fetch(
        &self,
        id: &str,
        token: &CancellationToken,
    ) -> Result<PartialRecord, AcquireError> {
        let app_key = self
            .config
            .app_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AcquireError::config("api credentials not configured"))?;

        if token.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }

        let url = self.config.endpoint_template.replace("{id}", id);
        debug!(url, "fetching structured product data");

        let response = tokio::select! {
            result = self
                .client
                .get(&url)
                .header("X-App-Key", app_key)
                .header("Accept", "application/json")
                .send() => result.map_err(classify_reqwest_error)?,
            _ = token.cancelled() => return Err(AcquireError::Cancelled),
        };

        match response.status().as_u16() {
            401 | 403 => return Err(AcquireError::config("api credentials rejected")),
            404 => return Err(AcquireError::validation(format!("product {id} not found"))),
            429 => return Err(AcquireError::blocked("api rate limit exceeded")),
            status if status >= 500 => {
                return Err(AcquireError::network(format!("api server error: {status}")))
            }
            _ => {}
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| AcquireError::parse(format!("api payload not valid json: {e}")))?;

        Ok(map_payload(&payload))
    }
}

/// Map the API payload onto a partial record. Tolerates both a flat product
/// object and a `{"result": {...}}` envelope; anything absent stays absent.
fn map_payload(payload: &Value) -> PartialRecord {
    let product = payload.get("result").unwrap_or(payload);

    let price_node = product.get("price");
    let price = match price_node {
        Some(Value::Object(_)) => price_node
            .and_then(|p| p.get("amount"))
            .and_then(Value::as_f64),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|p| *p > 0.0);
    let currency = price_node
        .and_then(|p| p.get("currency"))
        .or_else(|| product.get("currency"))
        .and_then(Value::as_str)
        .map(|c| c.trim().to_uppercase())
        .filter(|c| c.len() == 3);

    let stock = match product.get("stock") {
        Some(Value::Bool(b)) => Some(if *b {
            StockStatus::Available
        } else {
            StockStatus::OutOfStock
        }),
        Some(Value::Number(n)) => n.as_f64().map(|q| {
            if q > 0.0 {
                StockStatus::Available
            } else {
                StockStatus::OutOfStock
            }
        }),
        Some(Value::String(s)) => match s.to_lowercase().as_str() {
            "available" | "in_stock" | "instock" => Some(StockStatus::Available),
            "out_of_stock" | "sold_out" => Some(StockStatus::OutOfStock),
            _ => None,
        },
        _ => None,
    };

    PartialRecord {
        title: string_field(product, "title").or_else(|| string_field(product, "name")),
        price,
        currency,
        rating: product
            .get("rating")
            .and_then(Value::as_f64)
            .filter(|r| (0.0..=5.0).contains(r)),
        review_count: product
            .get("reviewCount")
            .or_else(|| product.get("review_count"))
            .and_then(Value::as_u64)
            .map(|n| n as u32),
        stock,
        seller: product
            .get("seller")
            .map(|s| match s {
                Value::Object(_) => s.get("name").and_then(Value::as_str),
                Value::String(name) => Some(name.as_str()),
                _ => None,
            })
            .flatten()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        images: product
            .get("images")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn missing_credentials_is_fatal_config_error() {
        let client = ApiProductClient::new(ApiClientConfig::default()).unwrap();
        let token = CancellationToken::new();

        let err = client.fetch("42", &token).await.unwrap_err();
        assert!(matches!(err, AcquireError::Config { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn maps_enveloped_payload() {
        let payload = json!({
            "result": {
                "title": "Wireless Mouse",
                "price": { "amount": 15.99, "currency": "usd" },
                "rating": 4.6,
                "reviewCount": 320,
                "stock": 12,
                "seller": { "name": "Acme Store" },
                "images": ["https://img.example.com/m.jpg"]
            }
        });

        let record = map_payload(&payload);
        assert_eq!(record.title.as_deref(), Some("Wireless Mouse"));
        assert_eq!(record.price, Some(15.99));
        assert_eq!(record.currency.as_deref(), Some("USD"));
        assert_eq!(record.rating, Some(4.6));
        assert_eq!(record.review_count, Some(320));
        assert_eq!(record.stock, Some(StockStatus::Available));
        assert_eq!(record.seller.as_deref(), Some("Acme Store"));
        assert_eq!(record.images.len(), 1);
    }

    #[test]
    fn maps_flat_payload_with_string_price() {
        let payload = json!({
            "name": "USB Cable",
            "price": "3.50",
            "currency": "EUR",
            "stock": "sold_out",
            "seller": "CableHut"
        });

        let record = map_payload(&payload);
        assert_eq!(record.title.as_deref(), Some("USB Cable"));
        assert_eq!(record.price, Some(3.5));
        assert_eq!(record.currency.as_deref(), Some("EUR"));
        assert_eq!(record.stock, Some(StockStatus::OutOfStock));
        assert_eq!(record.seller.as_deref(), Some("CableHut"));
    }

    #[test]
    fn absent_fields_stay_absent() {
        let record = map_payload(&json!({ "unrelated": true }));
        assert!(record.is_empty());
    }

    #[test]
    fn out_of_scale_rating_is_dropped() {
        let record = map_payload(&json!({ "title": "X", "rating": 8.9 }));
        assert!(record.rating.is_none());
    }
}
