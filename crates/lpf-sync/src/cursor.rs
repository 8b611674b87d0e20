//! Cursor-Advance Fetcher: walks the catalog id space one id per step.
//!
//! A step reserves the next id under a short cursor lock, fetches it outside
//! the transaction and settles the cursor in a second transaction according
//! to the response class. The settle never moves the cursor backwards and
//! only releases a lock it still owns.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use lpf_adapters::{harvested_record, newest_id};
use lpf_core::{FetchCursor, HarvestedRecord, ServiceKind};
use lpf_storage::{
    CatalogApi, ResponseClass, SessionHeaders, SessionProvider, Store, StoreTx,
};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CursorConfig;

/// Result of one fetch step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchOutcome {
    Stored {
        arka_id: i64,
    },
    Skipped {
        arka_id: i64,
        reason: String,
    },
    Backoff {
        arka_id: Option<i64>,
        reason: String,
        until: Option<DateTime<Utc>>,
    },
    Locked {
        until: Option<DateTime<Utc>>,
    },
    Error {
        arka_id: Option<i64>,
        reason: String,
    },
}

impl FetchOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }
}

/// Result of one bounded fetch tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchTick {
    pub latest_id: Option<i64>,
    pub caught_up: bool,
    /// Set when the tick stopped before stepping, e.g. `auth_failed`.
    pub halted: Option<String>,
    pub steps: Vec<FetchOutcome>,
}

impl FetchTick {
    pub fn stored(&self) -> usize {
        self.steps.iter().filter(|s| s.is_stored()).count()
    }
}

enum Reservation {
    Claimed { arka_id: i64, token: Option<String> },
    Refused(FetchOutcome),
}

/// Cursor changes applied after the catalog answered (or failed to).
struct Settlement {
    arka_id: i64,
    advance: bool,
    backoff: Option<Duration>,
    clear_backoff: bool,
    status: &'static str,
    error: Option<String>,
    record: Option<HarvestedRecord>,
}

impl Settlement {
    fn new(arka_id: i64, status: &'static str) -> Self {
        Self {
            arka_id,
            advance: false,
            backoff: None,
            clear_backoff: false,
            status,
            error: None,
            record: None,
        }
    }
}

enum LatestIds {
    Latest(Option<i64>),
    AuthFailed,
}

pub struct CursorFetcher<S: Store> {
    store: S,
    catalog: Arc<dyn CatalogApi>,
    sessions: Arc<dyn SessionProvider>,
    config: CursorConfig,
    holder: String,
}

impl<S: Store> CursorFetcher<S> {
    pub fn new(
        store: S,
        catalog: Arc<dyn CatalogApi>,
        sessions: Arc<dyn SessionProvider>,
        config: CursorConfig,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            store,
            catalog,
            sessions,
            config,
            holder: holder.into(),
        }
    }

    pub async fn step(&self, force: bool) -> Result<FetchOutcome> {
        self.step_at(Utc::now(), force).await
    }

    pub async fn step_at(&self, now: DateTime<Utc>, force: bool) -> Result<FetchOutcome> {
        let (arka_id, token) = match self.reserve(now, force).await? {
            Reservation::Claimed { arka_id, token } => (arka_id, token),
            Reservation::Refused(outcome) => {
                debug!(?outcome, "cursor step refused");
                return Ok(outcome);
            }
        };

        let Some(session) = self.sessions.active_headers(ServiceKind::Arka).await? else {
            warn!(arka_id, "no usable arka session; releasing cursor");
            let mut settle = Settlement::new(arka_id, "missing_headers");
            settle.error = Some("missing_headers".to_string());
            self.settle(now, token.as_deref(), settle).await?;
            return Ok(FetchOutcome::Error {
                arka_id: Some(arka_id),
                reason: "missing_headers".to_string(),
            });
        };

        let started = Instant::now();
        let (settle, mut outcome) = self.classify(now, arka_id, &session).await;
        // Backoff runs from the moment the catalog answered, not from the reservation.
        let answered_at =
            now + Duration::from_std(started.elapsed()).unwrap_or_else(|_| Duration::zero());
        if let (FetchOutcome::Backoff { until, .. }, Some(backoff)) = (&mut outcome, settle.backoff) {
            *until = Some(answered_at + backoff);
        }
        self.settle(answered_at, token.as_deref(), settle).await?;
        match &outcome {
            FetchOutcome::Stored { .. } => info!(arka_id, "harvested catalog record"),
            FetchOutcome::Skipped { reason, .. } => debug!(arka_id, %reason, "skipped catalog id"),
            other => warn!(arka_id, outcome = ?other, "catalog fetch did not succeed"),
        }
        Ok(outcome)
    }

    /// Looks up the newest published id, then runs up to `steps_per_tick` steps
    /// while each one stores a record.
    pub async fn tick(&self) -> Result<FetchTick> {
        let mut tick = FetchTick::default();

        if let Some(session) = self.sessions.active_headers(ServiceKind::Arka).await? {
            match self.fetch_latest(&session).await? {
                LatestIds::AuthFailed => {
                    tick.halted = Some("auth_failed".to_string());
                    return Ok(tick);
                }
                LatestIds::Latest(latest) => tick.latest_id = latest,
            }
        }

        if let Some(latest) = tick.latest_id {
            let cursor = self.status().await?;
            if cursor.next_fetch_id > latest {
                debug!(next = cursor.next_fetch_id, latest, "cursor caught up");
                tick.caught_up = true;
                return Ok(tick);
            }
        }

        for _ in 0..self.config.steps_per_tick {
            let outcome = self.step_at(Utc::now(), false).await?;
            let stored = outcome.is_stored();
            tick.steps.push(outcome);
            if !stored {
                break;
            }
        }
        Ok(tick)
    }

    /// Current cursor with the floor applied; nothing is written.
    pub async fn status(&self) -> Result<FetchCursor> {
        let mut tx = self.store.begin().await?;
        let mut cursor = tx.lock_cursor(self.config.floor, Utc::now()).await?;
        cursor.next_fetch_id = cursor.next_fetch_id.max(self.config.floor);
        Ok(cursor)
    }

    /// Moves the cursor to `to` (default: the floor) and clears lock and backoff.
    pub async fn reset(&self, to: Option<i64>) -> Result<FetchCursor> {
        let target = to.unwrap_or(self.config.floor);
        if target < self.config.floor {
            bail!("cursor target {target} is below the floor {}", self.config.floor);
        }
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut cursor = tx.lock_cursor(self.config.floor, now).await?;
        cursor.next_fetch_id = target;
        cursor.locked_until = None;
        cursor.locked_by = None;
        cursor.backoff_until = None;
        cursor.last_status = Some("reset".to_string());
        cursor.last_error = None;
        cursor.updated_at = now;
        tx.save_cursor(&cursor).await?;
        tx.commit().await?;
        info!(next_fetch_id = target, "cursor reset");
        Ok(cursor)
    }

    async fn reserve(&self, now: DateTime<Utc>, force: bool) -> Result<Reservation> {
        let mut tx = self.store.begin().await?;
        let mut cursor = tx.lock_cursor(self.config.floor, now).await?;
        if cursor.next_fetch_id < self.config.floor {
            cursor.next_fetch_id = self.config.floor;
        }

        if force {
            let arka_id = cursor.next_fetch_id;
            cursor.next_fetch_id += 1;
            cursor.updated_at = now;
            tx.save_cursor(&cursor).await?;
            tx.commit().await?;
            return Ok(Reservation::Claimed {
                arka_id,
                token: None,
            });
        }

        if cursor.is_locked(now) {
            return Ok(Reservation::Refused(FetchOutcome::Locked {
                until: cursor.locked_until,
            }));
        }
        if cursor.in_backoff(now) {
            return Ok(Reservation::Refused(FetchOutcome::Backoff {
                arka_id: None,
                reason: "backoff_active".to_string(),
                until: cursor.backoff_until,
            }));
        }

        let token = format!("{}/{}", self.holder, Uuid::new_v4());
        cursor.locked_until = Some(now + self.config.lock);
        cursor.locked_by = Some(token.clone());
        cursor.updated_at = now;
        let arka_id = cursor.next_fetch_id;
        tx.save_cursor(&cursor).await?;
        tx.commit().await?;
        Ok(Reservation::Claimed {
            arka_id,
            token: Some(token),
        })
    }

    async fn classify(
        &self,
        now: DateTime<Utc>,
        arka_id: i64,
        session: &SessionHeaders,
    ) -> (Settlement, FetchOutcome) {
        let resp = match self.catalog.fetch_record(session, arka_id).await {
            Ok(resp) => resp,
            Err(err) => {
                let mut settle = Settlement::new(arka_id, "network_error");
                settle.error = Some(err.to_string());
                return (
                    settle,
                    FetchOutcome::Error {
                        arka_id: Some(arka_id),
                        reason: "network_error".to_string(),
                    },
                );
            }
        };

        let code = format!("http_{}", resp.status.as_u16());
        match resp.class() {
            ResponseClass::Success => {
                let payload = resp.body.unwrap_or_else(|| json!({}));
                let mut settle = Settlement::new(arka_id, "stored");
                settle.advance = true;
                settle.clear_backoff = true;
                settle.record = Some(harvested_record(arka_id, payload, now));
                (settle, FetchOutcome::Stored { arka_id })
            }
            ResponseClass::NotFound => {
                let mut settle = Settlement::new(arka_id, "not_found");
                settle.advance = true;
                (
                    settle,
                    FetchOutcome::Skipped {
                        arka_id,
                        reason: "not_found".to_string(),
                    },
                )
            }
            ResponseClass::RateLimited => {
                let mut settle = Settlement::new(arka_id, "rate_limit");
                settle.backoff = Some(self.config.rate_limit_backoff);
                settle.error = Some(code);
                (
                    settle,
                    FetchOutcome::Backoff {
                        arka_id: Some(arka_id),
                        reason: "rate_limit".to_string(),
                        until: None,
                    },
                )
            }
            ResponseClass::Unauthorized => {
                let mut settle = Settlement::new(arka_id, "skipped");
                settle.advance = true;
                settle.error = Some(code.clone());
                (
                    settle,
                    FetchOutcome::Skipped {
                        arka_id,
                        reason: code,
                    },
                )
            }
            ResponseClass::Upstream => {
                let mut settle = Settlement::new(arka_id, "upstream_error");
                settle.backoff = Some(self.config.upstream_backoff);
                settle.error = Some(code.clone());
                (
                    settle,
                    FetchOutcome::Error {
                        arka_id: Some(arka_id),
                        reason: code,
                    },
                )
            }
        }
    }

    async fn settle(
        &self,
        now: DateTime<Utc>,
        token: Option<&str>,
        settle: Settlement,
    ) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let mut cursor = tx.lock_cursor(self.config.floor, now).await?;

        if let Some(record) = &settle.record {
            tx.upsert_harvested(record).await?;
        }
        if settle.advance {
            cursor.next_fetch_id = cursor.next_fetch_id.max(settle.arka_id + 1);
        }
        if let Some(backoff) = settle.backoff {
            cursor.backoff_until = Some(now + backoff);
        } else if settle.clear_backoff {
            cursor.backoff_until = None;
        }
        if token.is_some() && cursor.locked_by.as_deref() == token {
            cursor.locked_until = None;
            cursor.locked_by = None;
        }
        cursor.last_status = Some(settle.status.to_string());
        cursor.last_error = settle.error;
        cursor.updated_at = now;

        tx.save_cursor(&cursor).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_latest(&self, session: &SessionHeaders) -> Result<LatestIds> {
        let resp = match self.catalog.latest_ids(session).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(error = %err, "latest-ids lookup failed; stepping without it");
                return Ok(LatestIds::Latest(None));
            }
        };

        if matches!(resp.status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            warn!(
                session_id = session.session_id,
                status = %resp.status,
                "latest-ids lookup rejected credentials; deactivating session"
            );
            self.sessions
                .deactivate(session.session_id, "auth_failed")
                .await?;
            return Ok(LatestIds::AuthFailed);
        }

        if resp.class() != ResponseClass::Success {
            warn!(status = %resp.status, "latest-ids lookup returned an error status");
            return Ok(LatestIds::Latest(None));
        }

        let latest = resp
            .body
            .as_ref()
            .and_then(|body| match newest_id(body) {
                Ok(latest) => latest,
                Err(err) => {
                    warn!(error = %err, "unreadable latest-ids body");
                    None
                }
            });
        Ok(LatestIds::Latest(latest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpf_core::TransferStatus;
    use lpf_storage::testing::ScriptedCatalog;
    use lpf_storage::{CatalogError, CatalogResponse, MemorySessions, MemoryStore};

    struct Harness {
        store: MemoryStore,
        catalog: Arc<ScriptedCatalog>,
        sessions: Arc<MemorySessions>,
        fetcher: CursorFetcher<MemoryStore>,
    }

    fn harness(floor: i64, with_session: bool) -> Harness {
        let store = MemoryStore::new();
        let catalog = Arc::new(ScriptedCatalog::new());
        let sessions = Arc::new(MemorySessions::new());
        if with_session {
            sessions.insert(ServiceKind::Arka, [("Authorization", "Bearer arka")]);
        }
        let config = CursorConfig {
            floor,
            ..CursorConfig::default()
        };
        let fetcher = CursorFetcher::new(
            store.clone(),
            catalog.clone(),
            sessions.clone(),
            config,
            "test-instance",
        );
        Harness {
            store,
            catalog,
            sessions,
            fetcher,
        }
    }

    fn record_body(token: &str) -> serde_json::Value {
        json!({
            "data": {
                "link": format!("https://divar.ir/v/apartment/{token}"),
                "phone": "۰۹۱۲۳۴۵۶۷۸۹",
                "owner_name": "Sara"
            }
        })
    }

    #[tokio::test]
    async fn not_found_advances_and_skips() {
        let h = harness(10042, true);
        h.catalog.push_fetch(Ok(CatalogResponse::status_only(404)));

        let outcome = h.fetcher.step_at(Utc::now(), false).await.unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Skipped {
                arka_id: 10042,
                reason: "not_found".into()
            }
        );
        let cursor = h.store.cursor().await.unwrap();
        assert_eq!(cursor.next_fetch_id, 10043);
        assert!(cursor.locked_until.is_none());
        assert!(cursor.backoff_until.is_none());
    }

    #[tokio::test]
    async fn rate_limit_keeps_id_and_backs_off() {
        let h = harness(10042, true);
        let now = Utc::now();
        h.catalog.push_fetch(Ok(CatalogResponse::status_only(429)));

        let outcome = h.fetcher.step_at(now, false).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Backoff { ref reason, .. } if reason == "rate_limit"));
        let cursor = h.store.cursor().await.unwrap();
        assert_eq!(cursor.next_fetch_id, 10042);
        let until = cursor.backoff_until.unwrap();
        assert!(until >= now + Duration::seconds(10));
        assert!(until <= Utc::now() + Duration::seconds(10));
        assert!(cursor.locked_until.is_none());

        let again = h.fetcher.step_at(now + Duration::seconds(5), false).await.unwrap();
        assert!(matches!(again, FetchOutcome::Backoff { ref reason, .. } if reason == "backoff_active"));
        assert_eq!(h.catalog.fetched_ids(), vec![10042]);
    }

    #[tokio::test]
    async fn success_stores_record_and_clears_backoff() {
        let h = harness(7, true);
        let now = Utc::now();
        let mut cursor = FetchCursor::new(7, now);
        cursor.backoff_until = Some(now - Duration::seconds(1));
        h.store.set_cursor(cursor).await;

        let mut stale = HarvestedRecord::harvested(7, None, None, None, json!({}), now);
        stale.status = TransferStatus::Transferred;
        stale.transfer_attempt_count = 2;
        h.store.insert_record(stale).await;
        h.catalog.push_fetch(Ok(CatalogResponse::json(200, record_body("Tok7"))));

        let outcome = h.fetcher.step_at(now, false).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Stored { arka_id: 7 });

        let record = h.store.record(7).await.unwrap();
        assert_eq!(record.external_id.as_deref(), Some("Tok7"));
        assert_eq!(record.phone_number.as_deref(), Some("09123456789"));
        assert_eq!(record.status, TransferStatus::NotTransferred);
        assert_eq!(record.transfer_attempt_count, 0);

        let cursor = h.store.cursor().await.unwrap();
        assert_eq!(cursor.next_fetch_id, 8);
        assert!(cursor.backoff_until.is_none());
        assert_eq!(cursor.last_status.as_deref(), Some("stored"));
    }

    #[tokio::test]
    async fn unauthorized_record_is_skipped_without_backoff() {
        let h = harness(20, true);
        h.catalog.push_fetch(Ok(CatalogResponse::status_only(412)));

        let outcome = h.fetcher.step_at(Utc::now(), false).await.unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Skipped {
                arka_id: 20,
                reason: "http_412".into()
            }
        );
        let cursor = h.store.cursor().await.unwrap();
        assert_eq!(cursor.next_fetch_id, 21);
        assert!(cursor.backoff_until.is_none());
    }

    #[tokio::test]
    async fn upstream_error_backs_off_fifteen_seconds() {
        let h = harness(20, true);
        let now = Utc::now();
        h.catalog.push_fetch(Ok(CatalogResponse::status_only(502)));

        let outcome = h.fetcher.step_at(now, false).await.unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Error {
                arka_id: Some(20),
                reason: "http_502".into()
            }
        );
        let cursor = h.store.cursor().await.unwrap();
        assert_eq!(cursor.next_fetch_id, 20);
        let until = cursor.backoff_until.unwrap();
        assert!(until >= now + Duration::seconds(15));
        assert!(until <= Utc::now() + Duration::seconds(15));
    }

    #[tokio::test]
    async fn slow_rate_limit_backs_off_from_the_answer() {
        let h = harness(20, true);
        let now = Utc::now();
        h.catalog.set_fetch_delay(std::time::Duration::from_millis(300));
        h.catalog.push_fetch(Ok(CatalogResponse::status_only(429)));

        let outcome = h.fetcher.step_at(now, false).await.unwrap();
        let until = h.store.cursor().await.unwrap().backoff_until.unwrap();
        assert!(until >= now + Duration::milliseconds(10_300));
        assert_eq!(
            outcome,
            FetchOutcome::Backoff {
                arka_id: Some(20),
                reason: "rate_limit".into(),
                until: Some(until),
            }
        );
    }

    #[tokio::test]
    async fn concurrent_steps_admit_a_single_lock_holder() {
        let h = harness(30, true);
        let now = Utc::now();
        h.catalog.set_fetch_delay(std::time::Duration::from_millis(50));
        h.catalog.push_fetch(Ok(CatalogResponse::status_only(404)));

        let (a, b) = tokio::join!(h.fetcher.step_at(now, false), h.fetcher.step_at(now, false));
        let outcomes = [a.unwrap(), b.unwrap()];
        let holders = outcomes
            .iter()
            .filter(|o| !matches!(o, FetchOutcome::Locked { .. }))
            .count();
        assert_eq!(holders, 1, "{outcomes:?}");
        assert_eq!(h.catalog.fetched_ids(), vec![30]);

        let cursor = h.store.cursor().await.unwrap();
        assert_eq!(cursor.next_fetch_id, 31);
        assert!(cursor.locked_until.is_none());
    }

    #[tokio::test]
    async fn transport_failure_only_releases_lock() {
        let h = harness(20, true);
        h.catalog
            .push_fetch(Err(CatalogError::Transport("connection reset".into())));

        let outcome = h.fetcher.step_at(Utc::now(), false).await.unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Error {
                arka_id: Some(20),
                reason: "network_error".into()
            }
        );
        let cursor = h.store.cursor().await.unwrap();
        assert_eq!(cursor.next_fetch_id, 20);
        assert!(cursor.locked_until.is_none());
        assert!(cursor.backoff_until.is_none());
        assert!(cursor.last_error.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn missing_session_releases_lock_without_fetching() {
        let h = harness(20, false);

        let outcome = h.fetcher.step_at(Utc::now(), false).await.unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Error {
                arka_id: Some(20),
                reason: "missing_headers".into()
            }
        );
        assert!(h.catalog.fetched_ids().is_empty());
        let cursor = h.store.cursor().await.unwrap();
        assert_eq!(cursor.next_fetch_id, 20);
        assert!(cursor.locked_until.is_none());
        assert_eq!(cursor.last_error.as_deref(), Some("missing_headers"));
    }

    #[tokio::test]
    async fn live_lock_refuses_and_expired_lock_is_free() {
        let h = harness(20, true);
        let now = Utc::now();
        let mut cursor = FetchCursor::new(20, now);
        cursor.locked_until = Some(now + Duration::milliseconds(150));
        cursor.locked_by = Some("other".into());
        h.store.set_cursor(cursor).await;

        let outcome = h.fetcher.step_at(now, false).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Locked { .. }));
        assert!(h.catalog.fetched_ids().is_empty());

        let later = h
            .fetcher
            .step_at(now + Duration::milliseconds(150), false)
            .await
            .unwrap();
        assert!(matches!(later, FetchOutcome::Skipped { arka_id: 20, .. }));
    }

    #[tokio::test]
    async fn forced_step_ignores_backoff() {
        let h = harness(20, true);
        let now = Utc::now();
        let mut cursor = FetchCursor::new(30, now);
        cursor.backoff_until = Some(now + Duration::minutes(1));
        h.store.set_cursor(cursor).await;
        h.catalog.push_fetch(Ok(CatalogResponse::json(200, record_body("Forced"))));

        let outcome = h.fetcher.step_at(now, true).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Stored { arka_id: 30 });
        let cursor = h.store.cursor().await.unwrap();
        assert_eq!(cursor.next_fetch_id, 31);
        assert!(cursor.backoff_until.is_none());
    }

    #[tokio::test]
    async fn cursor_below_floor_is_raised() {
        let h = harness(500, true);
        h.store.set_cursor(FetchCursor::new(3, Utc::now())).await;

        h.fetcher.step_at(Utc::now(), false).await.unwrap();
        assert_eq!(h.catalog.fetched_ids(), vec![500]);
        assert_eq!(h.store.cursor().await.unwrap().next_fetch_id, 501);
    }

    #[tokio::test]
    async fn tick_stops_at_first_non_stored_step() {
        let h = harness(1, true);
        h.catalog
            .set_latest(Ok(CatalogResponse::json(200, json!({ "ids": [9] }))));
        h.catalog.push_fetch(Ok(CatalogResponse::json(200, record_body("A1"))));
        h.catalog.push_fetch(Ok(CatalogResponse::json(200, record_body("A2"))));
        h.catalog.push_fetch(Ok(CatalogResponse::status_only(404)));

        let tick = h.fetcher.tick().await.unwrap();
        assert_eq!(tick.latest_id, Some(9));
        assert_eq!(tick.stored(), 2);
        assert_eq!(tick.steps.len(), 3);
        assert_eq!(h.catalog.fetched_ids(), vec![1, 2, 3]);
        assert_eq!(h.store.cursor().await.unwrap().next_fetch_id, 4);
    }

    #[tokio::test]
    async fn tick_is_bounded_by_step_budget() {
        let h = harness(1, true);
        for i in 0..12 {
            h.catalog
                .push_fetch(Ok(CatalogResponse::json(200, record_body(&format!("B{i}")))));
        }

        let tick = h.fetcher.tick().await.unwrap();
        assert_eq!(tick.latest_id, None);
        assert_eq!(tick.stored(), 10);
        assert_eq!(h.store.cursor().await.unwrap().next_fetch_id, 11);
    }

    #[tokio::test]
    async fn tick_ends_when_cursor_is_past_latest() {
        let h = harness(100, true);
        h.catalog
            .set_latest(Ok(CatalogResponse::json(200, json!([{ "id": 99 }]))));

        let tick = h.fetcher.tick().await.unwrap();
        assert!(tick.caught_up);
        assert!(tick.steps.is_empty());
        assert!(h.catalog.fetched_ids().is_empty());
    }

    #[tokio::test]
    async fn latest_ids_rejection_deactivates_session() {
        let h = harness(1, true);
        h.catalog.set_latest(Ok(CatalogResponse::status_only(401)));

        let tick = h.fetcher.tick().await.unwrap();
        assert_eq!(tick.halted.as_deref(), Some("auth_failed"));
        assert!(!h.sessions.is_active(1));
        assert_eq!(h.sessions.last_error(1).as_deref(), Some("auth_failed"));
        assert!(h.catalog.fetched_ids().is_empty());
    }

    #[tokio::test]
    async fn reset_rewinds_to_floor_and_rejects_lower_targets() {
        let h = harness(10, true);
        let now = Utc::now();
        let mut cursor = FetchCursor::new(90, now);
        cursor.backoff_until = Some(now + Duration::minutes(5));
        h.store.set_cursor(cursor).await;

        let cursor = h.fetcher.reset(None).await.unwrap();
        assert_eq!(cursor.next_fetch_id, 10);
        assert!(cursor.backoff_until.is_none());
        assert_eq!(h.fetcher.reset(Some(40)).await.unwrap().next_fetch_id, 40);
        assert!(h.fetcher.reset(Some(9)).await.is_err());
        assert_eq!(h.fetcher.status().await.unwrap().next_fetch_id, 40);
    }
}
