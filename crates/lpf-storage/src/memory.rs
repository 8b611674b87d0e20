//! In-memory [`Store`] used by tests and local dry runs.
//!
//! A transaction holds the store-wide mutex for its whole lifetime and works on
//! a copy of the state, so transactions are serializable and an uncommitted
//! transaction leaves nothing behind.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lpf_core::{lock_is_live, BusinessPhoneCache, FetchCursor, HarvestedRecord, ListingPost};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::store::{is_lease_candidate, Store, StoreTx, TransferFilter};
use crate::StoreError;

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub cursor: Option<FetchCursor>,
    pub records: BTreeMap<i64, HarvestedRecord>,
    pub posts: BTreeMap<i64, ListingPost>,
    pub business: BTreeMap<String, BusinessPhoneCache>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    pub async fn insert_post(&self, post: ListingPost) {
        self.state.lock().await.posts.insert(post.id, post);
    }

    pub async fn insert_record(&self, record: HarvestedRecord) {
        self.state.lock().await.records.insert(record.arka_id, record);
    }

    pub async fn insert_business(&self, entry: BusinessPhoneCache) {
        self.state
            .lock()
            .await
            .business
            .insert(entry.business_ref.clone(), entry);
    }

    pub async fn post(&self, id: i64) -> Option<ListingPost> {
        self.state.lock().await.posts.get(&id).cloned()
    }

    pub async fn record(&self, arka_id: i64) -> Option<HarvestedRecord> {
        self.state.lock().await.records.get(&arka_id).cloned()
    }

    pub async fn business(&self, business_ref: &str) -> Option<BusinessPhoneCache> {
        self.state.lock().await.business.get(business_ref).cloned()
    }

    pub async fn cursor(&self) -> Option<FetchCursor> {
        self.state.lock().await.cursor.clone()
    }

    pub async fn set_cursor(&self, cursor: FetchCursor) {
        self.state.lock().await.cursor = Some(cursor);
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(MemoryTx { guard, working })
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_cursor(
        &mut self,
        floor: i64,
        now: DateTime<Utc>,
    ) -> Result<FetchCursor, StoreError> {
        Ok(self
            .working
            .cursor
            .get_or_insert_with(|| FetchCursor::new(floor, now))
            .clone())
    }

    async fn save_cursor(&mut self, cursor: &FetchCursor) -> Result<(), StoreError> {
        self.working.cursor = Some(cursor.clone());
        Ok(())
    }

    async fn upsert_harvested(&mut self, record: &HarvestedRecord) -> Result<(), StoreError> {
        self.working.records.insert(record.arka_id, record.clone());
        Ok(())
    }

    async fn lock_next_transferable(
        &mut self,
        filter: &TransferFilter,
    ) -> Result<Option<HarvestedRecord>, StoreError> {
        Ok(self
            .working
            .records
            .values()
            .filter(|r| filter.admits(r))
            .min_by_key(|r| (r.fetched_at, r.arka_id))
            .cloned())
    }

    async fn save_harvested(&mut self, record: &HarvestedRecord) -> Result<(), StoreError> {
        if let Some(existing) = self.working.records.get_mut(&record.arka_id) {
            *existing = record.clone();
        }
        Ok(())
    }

    async fn lock_missing_post_matches(
        &mut self,
        filter: &TransferFilter,
        limit: i64,
    ) -> Result<Vec<(HarvestedRecord, ListingPost)>, StoreError> {
        let mut records = self
            .working
            .records
            .values()
            .filter(|r| filter.admits_catch_up(r))
            .collect::<Vec<_>>();
        records.sort_by_key(|r| (r.fetched_at, r.arka_id));

        let mut out = Vec::new();
        for record in records {
            let Some(external_id) = record.external_id.as_deref() else {
                continue;
            };
            let matches = self
                .working
                .posts
                .values()
                .filter(|p| p.external_id.as_deref() == Some(external_id) && p.phone_number.is_none());
            for post in matches {
                if out.len() as i64 >= limit {
                    return Ok(out);
                }
                out.push((record.clone(), post.clone()));
            }
        }
        Ok(out)
    }

    async fn lock_next_lease_candidate(
        &mut self,
        now: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<Option<ListingPost>, StoreError> {
        Ok(self
            .working
            .posts
            .values()
            .filter(|p| is_lease_candidate(p, now, max_attempts))
            .max_by_key(|p| (p.created_at, p.id))
            .cloned())
    }

    async fn lock_post_by_external_id(
        &mut self,
        external_id: &str,
    ) -> Result<Option<ListingPost>, StoreError> {
        Ok(self
            .working
            .posts
            .values()
            .find(|p| p.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn lock_post_by_lease(
        &mut self,
        lease_id: Uuid,
    ) -> Result<Option<ListingPost>, StoreError> {
        Ok(self
            .working
            .posts
            .values()
            .find(|p| p.phone_fetch_lease_id == Some(lease_id))
            .cloned())
    }

    async fn lock_lease_targets(
        &mut self,
        lease_id: Uuid,
        business_ref: Option<&str>,
    ) -> Result<Vec<ListingPost>, StoreError> {
        Ok(self
            .working
            .posts
            .values()
            .filter(|p| {
                p.phone_fetch_lease_id == Some(lease_id)
                    || business_ref.is_some_and(|b| p.business_ref.as_deref() == Some(b))
            })
            .cloned()
            .collect())
    }

    async fn save_post(&mut self, post: &ListingPost) -> Result<(), StoreError> {
        if let Some(existing) = self.working.posts.get_mut(&post.id) {
            *existing = post.clone();
        }
        Ok(())
    }

    async fn lock_business(
        &mut self,
        business_ref: &str,
    ) -> Result<BusinessPhoneCache, StoreError> {
        Ok(self
            .working
            .business
            .entry(business_ref.to_string())
            .or_insert_with(|| BusinessPhoneCache::empty(business_ref))
            .clone())
    }

    async fn lock_next_stale_title(
        &mut self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<BusinessPhoneCache>, StoreError> {
        Ok(self
            .working
            .business
            .values()
            .filter(|entry| {
                let stale = entry.title.is_none()
                    || entry.title_fetched_at.map_or(true, |at| at <= stale_before);
                stale && !lock_is_live(entry.locked_until, now)
            })
            .min_by_key(|entry| (entry.title_fetched_at, entry.business_ref.clone()))
            .cloned())
    }

    async fn save_business(&mut self, entry: &BusinessPhoneCache) -> Result<(), StoreError> {
        self.working
            .business
            .insert(entry.business_ref.clone(), entry.clone());
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        *self.guard = std::mem::take(&mut self.working);
        Ok(())
    }
}
