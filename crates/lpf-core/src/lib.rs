//! Core domain model for the listing phone pipeline: cursor, harvested records,
//! listing posts and the per-business phone cache.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lpf-core";

/// Fixed key of the singleton fetch cursor row.
pub const CURSOR_KEY: &str = "arka";

/// Placeholder number the catalog returns when the real contact is hidden.
pub const SENTINEL_PHONE: &str = "09000000000";

pub const PHONE_TTL_DAYS: i64 = 7;
pub const TITLE_TTL_DAYS: i64 = 7;
pub const MAX_PHONE_FETCH_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// External services a session (credential header set) can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Numbered phone catalog the cursor walks.
    Arka,
    /// Listing marketplace, used for business brand lookups.
    Marketplace,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arka => "arka",
            Self::Marketplace => "marketplace",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    NotTransferred,
    InProgress,
    Transferred,
}

impl TransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotTransferred => "NOT_TRANSFERRED",
            Self::InProgress => "IN_PROGRESS",
            Self::Transferred => "TRANSFERRED",
        }
    }
}

impl FromStr for TransferStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_TRANSFERRED" => Ok(Self::NotTransferred),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "TRANSFERRED" => Ok(Self::Transferred),
            other => Err(UnknownVariant {
                kind: "transfer status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhoneFetchStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl PhoneFetchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

impl FromStr for PhoneFetchStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            other => Err(UnknownVariant {
                kind: "phone fetch status",
                value: other.to_string(),
            }),
        }
    }
}

/// `true` while `until` is strictly in the future. An expired-but-uncleared
/// lock counts as free.
pub fn lock_is_live(until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    until.is_some_and(|until| until > now)
}

/// Freshness check shared by phone and title TTLs: the boundary itself is stale.
pub fn is_fresh(stamp: Option<DateTime<Utc>>, ttl: Duration, now: DateTime<Utc>) -> bool {
    stamp.is_some_and(|stamp| now - stamp < ttl)
}

/// Singleton pointer to the next catalog id to harvest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCursor {
    pub id: String,
    pub next_fetch_id: i64,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub backoff_until: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl FetchCursor {
    pub fn new(floor: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: CURSOR_KEY.to_string(),
            next_fetch_id: floor,
            locked_until: None,
            locked_by: None,
            backoff_until: None,
            last_status: None,
            last_error: None,
            updated_at: now,
        }
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        lock_is_live(self.locked_until, now)
    }

    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        lock_is_live(self.backoff_until, now)
    }
}

/// One catalog record harvested by id, waiting to be copied onto its post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestedRecord {
    pub arka_id: i64,
    pub external_id: Option<String>,
    pub phone_number: Option<String>,
    pub owner_name: Option<String>,
    pub payload: JsonValue,
    pub status: TransferStatus,
    pub transfer_attempt_count: i32,
    pub transfer_locked_until: Option<DateTime<Utc>>,
    pub next_transfer_attempt_at: Option<DateTime<Utc>>,
    pub transfer_last_error: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub transferred_at: Option<DateTime<Utc>>,
}

impl HarvestedRecord {
    /// Fresh harvest with transfer state reset.
    pub fn harvested(
        arka_id: i64,
        external_id: Option<String>,
        phone_number: Option<String>,
        owner_name: Option<String>,
        payload: JsonValue,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            arka_id,
            external_id,
            phone_number,
            owner_name,
            payload,
            status: TransferStatus::NotTransferred,
            transfer_attempt_count: 0,
            transfer_locked_until: None,
            next_transfer_attempt_at: None,
            transfer_last_error: None,
            fetched_at,
            transferred_at: None,
        }
    }
}

/// Listing post as seen by the pipeline. Only the phone-related fields are
/// ever written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingPost {
    pub id: i64,
    pub external_id: Option<String>,
    pub contact_uuid: Option<String>,
    pub title: Option<String>,
    pub phone_number: Option<String>,
    pub owner_name: Option<String>,
    pub phone_fetch_status: PhoneFetchStatus,
    pub phone_fetch_locked_until: Option<DateTime<Utc>>,
    pub phone_fetch_lease_id: Option<Uuid>,
    pub phone_fetch_worker: Option<String>,
    pub phone_fetch_attempt_count: i32,
    pub phone_fetch_last_error: Option<String>,
    pub business_ref: Option<String>,
    pub business_type: Option<String>,
    pub raw_payload: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

impl ListingPost {
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.phone_fetch_lease_id.is_some() && lock_is_live(self.phone_fetch_locked_until, now)
    }

    pub fn clear_lease(&mut self) {
        self.phone_fetch_locked_until = None;
        self.phone_fetch_lease_id = None;
        self.phone_fetch_worker = None;
    }

    /// Marks the phone task satisfied and closes any lease.
    pub fn complete_with_phone(&mut self, phone_number: Option<String>) {
        if phone_number.is_some() {
            self.phone_number = phone_number;
        }
        self.phone_fetch_status = PhoneFetchStatus::Done;
        self.phone_fetch_last_error = None;
        self.clear_lease();
    }
}

/// Cached phone and display title per business reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessPhoneCache {
    pub business_ref: String,
    pub phone_number: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub title_fetched_at: Option<DateTime<Utc>>,
}

impl BusinessPhoneCache {
    pub fn empty(business_ref: impl Into<String>) -> Self {
        Self {
            business_ref: business_ref.into(),
            phone_number: None,
            fetched_at: None,
            locked_until: None,
            title: None,
            title_fetched_at: None,
        }
    }

    pub fn fresh_phone(&self, ttl: Duration, now: DateTime<Utc>) -> Option<&str> {
        if is_fresh(self.fetched_at, ttl, now) {
            self.phone_number.as_deref()
        } else {
            None
        }
    }

    pub fn title_is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.title.is_some() && is_fresh(self.title_fetched_at, ttl, now)
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        lock_is_live(self.locked_until, now)
    }

    pub fn record_phone(&mut self, phone_number: String, now: DateTime<Utc>) {
        self.phone_number = Some(phone_number);
        self.fetched_at = Some(now);
        self.locked_until = None;
    }
}

/// First code point of each non-Latin decimal digit block we map to ASCII.
const DIGIT_ZEROES: [u32; 6] = [
    0x0660, // Arabic-Indic
    0x06F0, // Extended Arabic-Indic (Persian)
    0x07C0, // NKo
    0x0966, // Devanagari
    0x09E6, // Bengali
    0xFF10, // Fullwidth
];

pub fn ascii_digit(ch: char) -> Option<char> {
    if ch.is_ascii_digit() {
        return Some(ch);
    }
    let code = ch as u32;
    DIGIT_ZEROES.iter().find_map(|zero| {
        let offset = code.checked_sub(*zero)?;
        if offset < 10 {
            char::from_digit(offset, 10)
        } else {
            None
        }
    })
}

/// Maps non-Latin decimal digits to ASCII and drops everything else.
pub fn normalize_digits(input: &str) -> String {
    input.chars().filter_map(ascii_digit).collect()
}

/// Normalized phone, or `None` when nothing digit-like remains.
pub fn normalize_phone(input: &str) -> Option<String> {
    let digits = normalize_digits(input);
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// A phone worth writing onto a post: present and not the sentinel placeholder.
pub fn usable_phone(phone: Option<&str>) -> Option<String> {
    phone
        .and_then(normalize_phone)
        .filter(|phone| phone != SENTINEL_PHONE)
}
