//! Listing extraction from JSON APIs and JSON-LD annotated HTML.

use nestfeed_core::error::AppError;
use nestfeed_core::models::{ListingRecord, RawDocument, TransactionType};
use nestfeed_core::traits::Extractor;
use scraper::{Html, Selector};
use serde_json::Value;

/// Keys tried, in order, for the listing's stable identifier.
const ID_KEYS: &[&str] = &[
    "external_id",
    "mls_number",
    "mlsNumber",
    "listing_id",
    "listingId",
    "id",
    "sku",
    "identifier",
];

/// Keys that hold the listing array in a JSON search response.
const LIST_KEYS: &[&str] = &["results", "listings", "data", "items"];

/// Extracts listings from JSON search responses or HTML pages carrying
/// `application/ld+json` blocks.
#[derive(Debug, Clone, Default)]
pub struct JsonListingExtractor;

impl JsonListingExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Extractor for JsonListingExtractor {
    fn split_search_page(&self, body: &str) -> Result<Vec<RawDocument>, AppError> {
        let items = if looks_like_json(body) {
            let value: Value = serde_json::from_str(body.trim())?;
            listing_array(value)?
        } else {
            json_ld_objects(body)?
                .into_iter()
                .flat_map(flatten_json_ld)
                .collect()
        };

        Ok(items
            .into_iter()
            .filter(Value::is_object)
            .map(|item| {
                let url = item.get("url").and_then(Value::as_str).map(str::to_string);
                let document = RawDocument::new(item.to_string());
                match url {
                    Some(url) => document.with_source_url(url),
                    None => document,
                }
            })
            .collect())
    }

    fn extract(
        &self,
        document: &RawDocument,
        transaction: TransactionType,
    ) -> Result<ListingRecord, AppError> {
        let data = if looks_like_json(&document.body) {
            serde_json::from_str::<Value>(document.body.trim())?
        } else {
            json_ld_objects(&document.body)?
                .into_iter()
                .flat_map(flatten_json_ld)
                .find(|v| external_id(v).is_some())
                .ok_or_else(|| AppError::Extraction("no JSON-LD listing found in page".into()))?
        };

        let external_id = external_id(&data)
            .ok_or_else(|| AppError::Extraction("listing has no identifier".into()))?;

        let transaction = ["transaction_type", "transaction", "type"]
            .iter()
            .filter_map(|k| data.get(*k).and_then(Value::as_str))
            .find_map(|s| s.parse().ok())
            .unwrap_or(transaction);

        Ok(ListingRecord {
            external_id,
            transaction,
            url: data
                .get("url")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| document.source_url.clone()),
            price: price(&data),
            images: images(&data),
            data,
        })
    }
}

fn looks_like_json(body: &str) -> bool {
    matches!(body.trim_start().chars().next(), Some('{' | '['))
}

fn listing_array(value: Value) -> Result<Vec<Value>, AppError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => LIST_KEYS
            .iter()
            .find_map(|k| match map.remove(*k) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| AppError::Extraction("search response has no listing array".into())),
        _ => Err(AppError::Extraction(
            "search response is not an object or array".into(),
        )),
    }
}

/// Parse every `<script type="application/ld+json">` block. Malformed blocks are skipped.
fn json_ld_objects(html: &str) -> Result<Vec<Value>, AppError> {
    let selector = Selector::parse(r#"script[type="application/ld+json"]"#)
        .map_err(|e| AppError::Extraction(format!("Invalid selector: {e}")))?;
    let document = Html::parse_document(html);

    Ok(document
        .select(&selector)
        .filter_map(|script| {
            let text: String = script.text().collect();
            match serde_json::from_str::<Value>(text.trim()) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping malformed JSON-LD block");
                    None
                }
            }
        })
        .collect())
}

/// Unwrap arrays, `@graph` containers and `ItemList`s into individual objects.
fn flatten_json_ld(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.into_iter().flat_map(flatten_json_ld).collect(),
        Value::Object(mut map) => {
            if let Some(Value::Array(graph)) = map.remove("@graph") {
                return graph.into_iter().flat_map(flatten_json_ld).collect();
            }
            if let Some(Value::Array(elements)) = map.remove("itemListElement") {
                return elements
                    .into_iter()
                    .map(|mut element| match element.get_mut("item").map(Value::take) {
                        Some(item) if item.is_object() => item,
                        _ => element,
                    })
                    .collect();
            }
            vec![Value::Object(map)]
        }
        _ => Vec::new(),
    }
}

fn external_id(data: &Value) -> Option<String> {
    ID_KEYS.iter().find_map(|k| match data.get(*k)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn price(data: &Value) -> Option<f64> {
    let raw = data
        .get("price")
        .or_else(|| data.get("offers").and_then(|o| o.get("price")))?;
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let digits: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

fn images(data: &Value) -> Vec<String> {
    let raw = data.get("images").or_else(|| data.get("image"));
    match raw {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => o.get("url").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
