//! Document extraction: structured state blobs first, selector fallbacks second
//!
//! A loaded product page is turned into a `PartialRecord` by an ordered set
//! of strategies. Embedded bootstrap JSON (the data the page's own scripts
//! render from) is the most reliable source; ranked CSS selector candidates
//! per field are the fallback. Every field is either a value found in the
//! document or absent; nothing is ever fabricated here.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::domain::product::{PartialRecord, StockStatus};

static SCRIPT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("script").expect("static selector"));

static PRICE_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d[\d.,\s]*\d|\d").expect("static regex"));

static RATING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:[.,]\d+)?").expect("static regex"));

static COUNT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d[\d,.]*").expect("static regex"));

static CURRENCY_CODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(USD|EUR|GBP|CAD|AUD|BRL|PLN|RUB|INR|JPY|CNY|KRW|MXN|TRY)\b")
        .expect("static regex")
});

/// Dotted JSON paths per field, most specific first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldPaths {
    pub title: Vec<String>,
    pub price: Vec<String>,
    pub currency: Vec<String>,
    pub rating: Vec<String>,
    pub review_count: Vec<String>,
    pub stock: Vec<String>,
    pub seller: Vec<String>,
    pub images: Vec<String>,
}

/// One known bootstrap-state assignment to look for in inline scripts,
/// e.g. `window.runParams = {...};`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateBlobRule {
    pub marker: String,
    pub paths: FieldPaths,
}

/// Ranked CSS selector candidates per field, most specific first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSelectors {
    pub title: Vec<String>,
    pub price: Vec<String>,
    pub rating: Vec<String>,
    pub review_count: Vec<String>,
    pub stock: Vec<String>,
    pub seller: Vec<String>,
    pub images: Vec<String>,
}

impl Default for FieldSelectors {
    fn default() -> Self {
        Self {
            title: vec![
                "h1[data-pl='product-title']".into(),
                "h1.product-title-text".into(),
                ".product-title h1".into(),
                "h1".into(),
            ],
            price: vec![
                ".product-price-current".into(),
                ".product-price-value".into(),
                "[class*='price--current']".into(),
                ".uniform-banner-box-price".into(),
                "[itemprop='price']".into(),
            ],
            rating: vec![
                ".overview-rating-average".into(),
                "[class*='rating--average']".into(),
                "[itemprop='ratingValue']".into(),
            ],
            review_count: vec![
                ".product-reviewer-reviews".into(),
                "[class*='reviewer--reviews']".into(),
                "[itemprop='reviewCount']".into(),
            ],
            stock: vec![
                ".product-quantity-tip".into(),
                "[class*='quantity--info']".into(),
                "[itemprop='availability']".into(),
            ],
            seller: vec![
                ".shop-name a".into(),
                "[class*='store-header'] a".into(),
                "[data-pl='store-name']".into(),
            ],
            images: vec![
                ".images-view-item img".into(),
                "[class*='slider--img'] img".into(),
                ".magnifier-image".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub state_blobs: Vec<StateBlobRule>,
    pub selectors: FieldSelectors,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            state_blobs: vec![
                StateBlobRule {
                    marker: "window.runParams".into(),
                    paths: FieldPaths {
                        title: vec![
                            "data.titleModule.subject".into(),
                            "data.productInfoComponent.subject".into(),
                        ],
                        price: vec![
                            "data.priceModule.formatedActivityPrice".into(),
                            "data.priceModule.formatedPrice".into(),
                            "data.priceComponent.discountPrice.minActivityAmount.value".into(),
                        ],
                        currency: vec![
                            "data.commonModule.currencyCode".into(),
                            "data.currencyComponent.currencyCode".into(),
                        ],
                        rating: vec![
                            "data.titleModule.feedbackRating.averageStar".into(),
                            "data.feedbackComponent.evarageStar".into(),
                        ],
                        review_count: vec![
                            "data.titleModule.feedbackRating.totalValidNum".into(),
                            "data.feedbackComponent.totalValidNum".into(),
                        ],
                        stock: vec![
                            "data.quantityModule.totalAvailQuantity".into(),
                            "data.inventoryComponent.totalAvailQuantity".into(),
                        ],
                        seller: vec![
                            "data.storeModule.storeName".into(),
                            "data.sellerComponent.storeName".into(),
                        ],
                        images: vec![
                            "data.imageModule.imagePathList".into(),
                            "data.imageComponent.imagePathList".into(),
                        ],
                    },
                },
                StateBlobRule {
                    marker: "window.__INIT_DATA__".into(),
                    paths: FieldPaths {
                        title: vec!["data.title".into(), "title".into()],
                        price: vec!["data.price".into(), "price".into()],
                        currency: vec!["data.currency".into(), "currency".into()],
                        rating: vec!["data.rating".into(), "rating".into()],
                        review_count: vec!["data.reviewCount".into(), "reviewCount".into()],
                        stock: vec!["data.stock".into(), "stock".into()],
                        seller: vec!["data.seller".into(), "seller".into()],
                        images: vec!["data.images".into(), "images".into()],
                    },
                },
            ],
            selectors: FieldSelectors::default(),
        }
    }
}

/// Turns a loaded document into a `PartialRecord`; first success per field
/// wins across the ordered strategies.
pub struct ExtractionEngine {
    config: ExtractionConfig,
}

impl ExtractionEngine {
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(ExtractionConfig::default())
    }

    pub fn parse(&self, html: &str) -> PartialRecord {
        let doc = Html::parse_document(html);
        let mut record = PartialRecord::default();

        self.apply_state_blobs(&doc, &mut record);
        self.apply_ld_json(&doc, &mut record);
        self.apply_selectors(&doc, &mut record);

        debug!(
            title = record.title.is_some(),
            price = record.price.is_some(),
            rating = record.rating.is_some(),
            "extraction finished"
        );
        record
    }

    /// Strategy 1: embedded bootstrap-state blobs in inline scripts.
    fn apply_state_blobs(&self, doc: &Html, record: &mut PartialRecord) {
        for script in doc.select(&SCRIPT_SELECTOR) {
            let text: String = script.text().collect();
            if text.is_empty() {
                continue;
            }
            for rule in &self.config.state_blobs {
                if !text.contains(&rule.marker) {
                    continue;
                }
                let Some(json) = extract_json_after_marker(&text, &rule.marker) else {
                    continue;
                };
                let Ok(value) = serde_json::from_str::<Value>(json) else {
                    trace!(marker = %rule.marker, "state blob found but not parseable");
                    continue;
                };
                debug!(marker = %rule.marker, "reading fields from state blob");
                self.read_blob_fields(&value, &rule.paths, record);
            }
        }
    }

    fn read_blob_fields(&self, value: &Value, paths: &FieldPaths, record: &mut PartialRecord) {
        if record.title.is_none() {
            record.title = first_path_string(value, &paths.title);
        }
        if record.price.is_none() {
            if let Some(found) = first_path_value(value, &paths.price) {
                record.price = value_as_price(found);
                if record.currency.is_none() {
                    if let Some(text) = found.as_str() {
                        record.currency = infer_currency(text);
                    }
                }
            }
        }
        if record.currency.is_none() {
            record.currency = first_path_string(value, &paths.currency)
                .and_then(|text| infer_currency(&text).or(Some(text)))
                .filter(|c| c.len() == 3);
        }
        if record.rating.is_none() {
            record.rating = first_path_value(value, &paths.rating)
                .and_then(value_as_f64)
                .filter(|r| (0.0..=5.0).contains(r));
        }
        if record.review_count.is_none() {
            record.review_count = first_path_value(value, &paths.review_count)
                .and_then(value_as_f64)
                .map(|n| n as u32);
        }
        if record.stock.is_none() {
            record.stock = first_path_value(value, &paths.stock).and_then(value_as_stock);
        }
        if record.seller.is_none() {
            record.seller = first_path_string(value, &paths.seller);
        }
        if record.images.is_empty() {
            if let Some(found) = first_path_value(value, &paths.images) {
                record.images = value_as_images(found);
            }
        }
    }

    /// Strategy 1b: schema.org Product objects in ld+json scripts.
    fn apply_ld_json(&self, doc: &Html, record: &mut PartialRecord) {
        for script in doc.select(&SCRIPT_SELECTOR) {
            if script.value().attr("type") != Some("application/ld+json") {
                continue;
            }
            let text: String = script.text().collect();
            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            for product in ld_json_products(&value) {
                read_ld_json_product(product, record);
            }
        }
    }

    /// Strategy 2: ranked selector candidates, first non-empty text wins.
    fn apply_selectors(&self, doc: &Html, record: &mut PartialRecord) {
        if record.title.is_none() {
            record.title = first_selector_text(doc, &self.config.selectors.title);
        }
        if record.price.is_none() {
            if let Some(text) = first_selector_text(doc, &self.config.selectors.price) {
                record.price = normalize_price(&text);
                if record.currency.is_none() {
                    record.currency = infer_currency(&text);
                }
            }
        }
        if record.rating.is_none() {
            record.rating =
                first_selector_text(doc, &self.config.selectors.rating).and_then(|t| parse_rating(&t));
        }
        if record.review_count.is_none() {
            record.review_count = first_selector_text(doc, &self.config.selectors.review_count)
                .and_then(|t| parse_count(&t));
        }
        if record.stock.is_none() {
            record.stock = first_selector_text(doc, &self.config.selectors.stock)
                .map(|t| parse_stock_text(&t))
                .filter(|s| *s != StockStatus::Unknown);
        }
        if record.seller.is_none() {
            record.seller = first_selector_text(doc, &self.config.selectors.seller);
        }
        if record.images.is_empty() {
            record.images = collect_image_urls(doc, &self.config.selectors.images);
        }
    }
}

/// Slice a brace-balanced JSON object out of script text, starting at the
/// first `{` after the marker. Tracks string literals and escapes so braces
/// inside values do not end the scan early.
fn extract_json_after_marker<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    let marker_at = text.find(marker)?;
    let rest = &text[marker_at + marker.len()..];
    let open = rest.find('{')?;
    let candidate = &rest[open..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in candidate.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&candidate[..=idx]);
                }
            }
            _ => {}
        }
    }
    None
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn first_path_value<'a>(value: &'a Value, paths: &[String]) -> Option<&'a Value> {
    paths
        .iter()
        .find_map(|path| lookup_path(value, path))
        .filter(|v| !v.is_null())
}

fn first_path_string(value: &Value, paths: &[String]) -> Option<String> {
    first_path_value(value, paths)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn value_as_price(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|p| *p > 0.0),
        Value::String(s) => normalize_price(s),
        _ => None,
    }
}

fn value_as_stock(value: &Value) -> Option<StockStatus> {
    match value {
        // Quantity counters: zero means sold out.
        Value::Number(n) => n.as_f64().map(|q| {
            if q > 0.0 {
                StockStatus::Available
            } else {
                StockStatus::OutOfStock
            }
        }),
        Value::Bool(b) => Some(if *b {
            StockStatus::Available
        } else {
            StockStatus::OutOfStock
        }),
        Value::String(s) => {
            let status = parse_stock_text(s);
            (status != StockStatus::Unknown).then_some(status)
        }
        _ => None,
    }
}

fn value_as_images(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

/// Flatten an ld+json document into its Product objects (`@graph`, arrays
/// and bare objects all appear in the wild).
fn ld_json_products(value: &Value) -> Vec<&Value> {
    let mut products = Vec::new();
    let mut queue = vec![value];
    while let Some(current) = queue.pop() {
        match current {
            Value::Array(items) => queue.extend(items.iter()),
            Value::Object(map) => {
                if map.get("@type").and_then(|t| t.as_str()) == Some("Product") {
                    products.push(current);
                } else if let Some(graph) = map.get("@graph") {
                    queue.push(graph);
                }
            }
            _ => {}
        }
    }
    products
}

fn read_ld_json_product(product: &Value, record: &mut PartialRecord) {
    if record.title.is_none() {
        record.title = product
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
    }
    if record.images.is_empty() {
        if let Some(image) = product.get("image") {
            record.images = value_as_images(image);
        }
    }
    if let Some(rating) = product.get("aggregateRating") {
        if record.rating.is_none() {
            record.rating = rating
                .get("ratingValue")
                .and_then(value_as_f64)
                .filter(|r| (0.0..=5.0).contains(r));
        }
        if record.review_count.is_none() {
            record.review_count = rating
                .get("reviewCount")
                .and_then(value_as_f64)
                .map(|n| n as u32);
        }
    }

    let offers: Vec<&Value> = match product.get("offers") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(offer) => vec![offer],
        None => Vec::new(),
    };
    for offer in offers {
        if record.price.is_none() {
            record.price = offer.get("price").and_then(value_as_price);
        }
        if record.currency.is_none() {
            record.currency = offer
                .get("priceCurrency")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_uppercase())
                .filter(|s| s.len() == 3);
        }
        if record.stock.is_none() {
            record.stock = offer
                .get("availability")
                .and_then(|v| v.as_str())
                .map(|s| {
                    if s.contains("OutOfStock") {
                        StockStatus::OutOfStock
                    } else if s.contains("InStock") {
                        StockStatus::Available
                    } else {
                        StockStatus::Unknown
                    }
                })
                .filter(|s| *s != StockStatus::Unknown);
        }
        if record.seller.is_none() {
            record.seller = offer
                .get("seller")
                .and_then(|s| s.get("name"))
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
        }
    }
}

fn first_selector_text(doc: &Html, candidates: &[String]) -> Option<String> {
    for candidate in candidates {
        let Ok(selector) = Selector::parse(candidate) else {
            continue;
        };
        if let Some(text) = doc
            .select(&selector)
            .next()
            .map(element_text)
            .filter(|t| !t.is_empty())
        {
            return Some(text);
        }
    }
    None
}

fn element_text(element: ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn collect_image_urls(doc: &Html, candidates: &[String]) -> Vec<String> {
    for candidate in candidates {
        let Ok(selector) = Selector::parse(candidate) else {
            continue;
        };
        let urls: Vec<String> = doc
            .select(&selector)
            .filter_map(|el| {
                el.value()
                    .attr("src")
                    .or_else(|| el.value().attr("data-src"))
            })
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !urls.is_empty() {
            return urls;
        }
    }
    Vec::new()
}

/// Extract a price from free text: first numeric token, thousands separators
/// stripped, decimal separator normalized to a point.
///
/// Heuristic for a lone separator: a 3-digit trailing group is read as a
/// thousands group (`1.234` -> 1234), anything shorter as decimals.
pub fn normalize_price(text: &str) -> Option<f64> {
    let token: String = PRICE_TOKEN_RE
        .find(text)?
        .as_str()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    let last_comma = token.rfind(',');
    let last_dot = token.rfind('.');

    let cleaned = match (last_comma, last_dot) {
        (Some(comma), Some(dot)) => {
            let (decimal, thousands) = if dot > comma { ('.', ',') } else { (',', '.') };
            let stripped: String = token.chars().filter(|&c| c != thousands).collect();
            stripped.replace(decimal, ".")
        }
        (Some(sep), None) | (None, Some(sep)) => {
            let sep_char = token.as_bytes()[sep] as char;
            let frac_len = token.len() - sep - 1;
            let sep_count = token.matches(sep_char).count();
            if frac_len == 3 || sep_count > 1 {
                token.chars().filter(|&c| c != sep_char).collect()
            } else {
                token.replace(sep_char, ".")
            }
        }
        (None, None) => token,
    };

    cleaned
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite() && *p > 0.0)
}

/// Infer a currency from symbol or code text accompanying a price.
pub fn infer_currency(text: &str) -> Option<String> {
    if let Some(code) = CURRENCY_CODE_RE.find(text) {
        return Some(code.as_str().to_string());
    }
    const SYMBOLS: &[(&str, &str)] = &[
        ("US $", "USD"),
        ("US$", "USD"),
        ("C$", "CAD"),
        ("A$", "AUD"),
        ("R$", "BRL"),
        ("€", "EUR"),
        ("£", "GBP"),
        ("₽", "RUB"),
        ("zł", "PLN"),
        ("₹", "INR"),
        ("¥", "JPY"),
        ("₩", "KRW"),
        ("$", "USD"),
    ];
    SYMBOLS
        .iter()
        .find(|(symbol, _)| text.contains(symbol))
        .map(|(_, code)| (*code).to_string())
}

/// Parse a star rating; values outside the 0..=5 scale are discarded.
pub fn parse_rating(text: &str) -> Option<f64> {
    let raw = RATING_RE.find(text)?.as_str().replace(',', ".");
    raw.parse::<f64>().ok().filter(|r| (0.0..=5.0).contains(r))
}

fn parse_count(text: &str) -> Option<u32> {
    let raw: String = COUNT_RE
        .find(text)?
        .as_str()
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    raw.parse::<u32>().ok()
}

/// Map availability text onto the stock enum.
pub fn parse_stock_text(text: &str) -> StockStatus {
    let lowered = text.to_lowercase();
    if ["out of stock", "sold out", "unavailable", "discontinued"]
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return StockStatus::OutOfStock;
    }
    if ["in stock", "available", "add to cart", "pieces available", "instock"]
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return StockStatus::Available;
    }
    StockStatus::Unknown
}
