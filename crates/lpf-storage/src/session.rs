//! Session Provider: credential header sets for the external services.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lpf_core::{lock_is_live, ServiceKind};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::StoreError;

/// Ready-to-send headers of one stored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHeaders {
    pub session_id: i64,
    pub headers: BTreeMap<String, String>,
}

impl SessionHeaders {
    /// Forces `Content-Type: application/json`; `None` without an
    /// `Authorization` header.
    pub fn prepare(session_id: i64, raw: BTreeMap<String, String>) -> Option<Self> {
        let mut headers = raw
            .into_iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("content-type"))
            .collect::<BTreeMap<_, _>>();
        let has_auth = headers
            .iter()
            .any(|(name, value)| name.eq_ignore_ascii_case("authorization") && !value.trim().is_empty());
        if !has_auth {
            return None;
        }
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        Some(Self {
            session_id,
            headers,
        })
    }
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Headers of the most recently updated active, unlocked session for
    /// `kind`, or `None` when no usable session exists.
    async fn active_headers(&self, kind: ServiceKind) -> Result<Option<SessionHeaders>, StoreError>;

    async fn deactivate(&self, session_id: i64, reason: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgSessionProvider {
    pool: PgPool,
}

impl PgSessionProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn headers_from_json(value: &JsonValue) -> BTreeMap<String, String> {
    value
        .as_object()
        .map(|object| {
            object
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl SessionProvider for PgSessionProvider {
    async fn active_headers(&self, kind: ServiceKind) -> Result<Option<SessionHeaders>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, headers
              FROM service_sessions
             WHERE service = $1
               AND is_active
               AND (locked_until IS NULL OR locked_until <= NOW())
             ORDER BY updated_at DESC
             LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let session_id: i64 = row.try_get("id")?;
        let headers: JsonValue = row.try_get("headers")?;
        let prepared = SessionHeaders::prepare(session_id, headers_from_json(&headers));
        if prepared.is_none() {
            warn!(session_id, service = %kind, "active session has no authorization header");
        }
        Ok(prepared)
    }

    async fn deactivate(&self, session_id: i64, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE service_sessions
               SET is_active = FALSE,
                   last_error = $2,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(session_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct MemorySession {
    id: i64,
    kind: ServiceKind,
    headers: BTreeMap<String, String>,
    active: bool,
    locked_until: Option<DateTime<Utc>>,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

/// Session table kept in process memory.
#[derive(Debug, Default)]
pub struct MemorySessions {
    sessions: Mutex<Vec<MemorySession>>,
}

impl MemorySessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<I, K, V>(&self, kind: ServiceKind, headers: I) -> i64
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let id = sessions.len() as i64 + 1;
        sessions.push(MemorySession {
            id,
            kind,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            active: true,
            locked_until: None,
            last_error: None,
            updated_at: Utc::now() + chrono::Duration::milliseconds(id),
        });
        id
    }

    pub fn lock_until(&self, session_id: i64, until: DateTime<Utc>) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = sessions.iter_mut().find(|s| s.id == session_id) {
            session.locked_until = Some(until);
        }
    }

    pub fn is_active(&self, session_id: i64) -> bool {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.iter().any(|s| s.id == session_id && s.active)
    }

    pub fn last_error(&self, session_id: i64) -> Option<String> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .iter()
            .find(|s| s.id == session_id)
            .and_then(|s| s.last_error.clone())
    }
}

#[async_trait]
impl SessionProvider for MemorySessions {
    async fn active_headers(&self, kind: ServiceKind) -> Result<Option<SessionHeaders>, StoreError> {
        let now = Utc::now();
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let newest = sessions
            .iter()
            .filter(|s| s.kind == kind && s.active && !lock_is_live(s.locked_until, now))
            .max_by_key(|s| s.updated_at);
        Ok(newest.and_then(|s| SessionHeaders::prepare(s.id, s.headers.clone())))
    }

    async fn deactivate(&self, session_id: i64, reason: &str) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = sessions.iter_mut().find(|s| s.id == session_id) {
            session.active = false;
            session.last_error = Some(reason.to_string());
            session.updated_at = Utc::now();
        }
        Ok(())
    }
}
