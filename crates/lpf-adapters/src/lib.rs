//! Payload extraction for catalog records, latest-id lookups, post payloads and
//! marketplace brand lookups.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use lpf_core::{normalize_phone, HarvestedRecord};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "lpf-adapters";

const LINK_KEYS: [&str; 4] = ["link", "url", "post_link", "divar_link"];
const PHONE_KEYS: [&str; 4] = ["phone", "phone_number", "mobile", "contact_phone"];
const OWNER_KEYS: [&str; 4] = ["owner_name", "name", "owner", "contact_name"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unexpected payload shape: {0}")]
    Shape(String),
}

/// Fields the pipeline lifts out of one catalog record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordFields {
    pub external_id: Option<String>,
    pub phone_number: Option<String>,
    pub owner_name: Option<String>,
}

/// Business grouping metadata carried by a post's raw marketplace payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BusinessMeta {
    pub business_ref: Option<String>,
    pub business_type: Option<String>,
}

fn link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"/v/(?:[^/?#\s]+/)?([A-Za-z0-9_-]+)/?(?:[?#]|$)")
            .expect("link pattern is valid")
    })
}

/// Listing token from a marketplace link: the last segment of
/// `/v/<slug>/<token>` or `/v/<token>`.
pub fn external_id_from_link(link: &str) -> Option<String> {
    link_pattern()
        .captures(link.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Catalog responses sometimes wrap the record in `data`.
fn unwrap_data(payload: &JsonValue) -> &JsonValue {
    match payload.get("data") {
        Some(inner) if inner.is_object() => inner,
        _ => payload,
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn first_text(object: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match object.get(*key)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

pub fn extract_record_fields(payload: &JsonValue) -> RecordFields {
    let record = unwrap_data(payload);
    RecordFields {
        external_id: first_text(record, &LINK_KEYS).and_then(|link| external_id_from_link(&link)),
        phone_number: first_text(record, &PHONE_KEYS).and_then(|phone| normalize_phone(&phone)),
        owner_name: first_text(record, &OWNER_KEYS),
    }
}

/// Builds the row stored for a successful harvest, transfer state reset.
pub fn harvested_record(arka_id: i64, payload: JsonValue, fetched_at: DateTime<Utc>) -> HarvestedRecord {
    let fields = extract_record_fields(&payload);
    HarvestedRecord::harvested(
        arka_id,
        fields.external_id,
        fields.phone_number,
        fields.owner_name,
        payload,
        fetched_at,
    )
}

fn id_value(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Object(_) => value.get("id").and_then(id_value),
        _ => None,
    }
}

/// Ids listed by the latest-ids lookup, in response order.
pub fn parse_latest_ids(body: &JsonValue) -> Result<Vec<i64>, ExtractError> {
    let list = if body.is_array() {
        body
    } else if let Some(ids) = body.get("ids").filter(|v| v.is_array()) {
        ids
    } else if let Some(data) = body.get("data").filter(|v| v.is_array()) {
        data
    } else {
        return Err(ExtractError::Shape(
            "expected an array, `ids` or `data` list".to_string(),
        ));
    };
    Ok(list
        .as_array()
        .map(|items| items.iter().filter_map(id_value).collect())
        .unwrap_or_default())
}

pub fn newest_id(body: &JsonValue) -> Result<Option<i64>, ExtractError> {
    Ok(parse_latest_ids(body)?.into_iter().max())
}

fn business_field(payload: &JsonValue, flat: &[&str], nested: &[&str]) -> Option<String> {
    if let Some(found) = first_text(payload, flat) {
        return Some(found);
    }
    ["business", "webengage", "business_data"]
        .iter()
        .filter_map(|container| payload.get(*container))
        .find_map(|inner| first_text(inner, nested))
}

pub fn business_meta_from_payload(payload: &JsonValue) -> BusinessMeta {
    BusinessMeta {
        business_ref: business_field(
            payload,
            &["business_ref", "businessRef"],
            &["business_ref", "businessRef", "ref"],
        ),
        business_type: business_field(
            payload,
            &["business_type", "businessType"],
            &["business_type", "businessType", "type"],
        ),
    }
}

/// Display title from a brand lookup body; `None` when the shape is unknown.
pub fn brand_title(body: &JsonValue) -> Option<String> {
    let data = unwrap_data(body);
    first_text(data, &["brand_name", "title"])
        .or_else(|| data.get("brand").and_then(|b| first_text(b, &["name", "title"])))
        .or_else(|| first_text(data, &["name"]))
}
