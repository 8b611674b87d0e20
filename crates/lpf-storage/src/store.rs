use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lpf_core::{
    lock_is_live, BusinessPhoneCache, FetchCursor, HarvestedRecord, ListingPost,
    PhoneFetchStatus, TransferStatus, SENTINEL_PHONE,
};
use uuid::Uuid;

use crate::StoreError;

/// A transactional store. Each pipeline step opens one transaction, claims the
/// rows it needs through `lock_*`, writes them back with `save_*` and commits.
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type Tx: StoreTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

#[async_trait]
pub trait StoreTx: Send + Sized {
    /// Loads the singleton cursor, creating it at `floor` when missing, and
    /// holds it until commit.
    async fn lock_cursor(&mut self, floor: i64, now: DateTime<Utc>)
        -> Result<FetchCursor, StoreError>;
    async fn save_cursor(&mut self, cursor: &FetchCursor) -> Result<(), StoreError>;

    /// Inserts or fully overwrites the record keyed by `arka_id`.
    async fn upsert_harvested(&mut self, record: &HarvestedRecord) -> Result<(), StoreError>;
    /// Oldest-fetched record the filter admits, skipping rows other
    /// transactions hold.
    async fn lock_next_transferable(
        &mut self,
        filter: &TransferFilter,
    ) -> Result<Option<HarvestedRecord>, StoreError>;
    async fn save_harvested(&mut self, record: &HarvestedRecord) -> Result<(), StoreError>;
    /// Non-transferred, phone-bearing records joined to phoneless posts by
    /// external id.
    async fn lock_missing_post_matches(
        &mut self,
        filter: &TransferFilter,
        limit: i64,
    ) -> Result<Vec<(HarvestedRecord, ListingPost)>, StoreError>;

    /// Newest post eligible for a phone-fetch lease.
    async fn lock_next_lease_candidate(
        &mut self,
        now: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<Option<ListingPost>, StoreError>;
    async fn lock_post_by_external_id(
        &mut self,
        external_id: &str,
    ) -> Result<Option<ListingPost>, StoreError>;
    async fn lock_post_by_lease(&mut self, lease_id: Uuid)
        -> Result<Option<ListingPost>, StoreError>;
    /// The post holding `lease_id` plus, when `business_ref` is given, every
    /// post of that business, locked in one pass in id order.
    async fn lock_lease_targets(
        &mut self,
        lease_id: Uuid,
        business_ref: Option<&str>,
    ) -> Result<Vec<ListingPost>, StoreError>;
    /// Writes back the phone-related columns of a post.
    async fn save_post(&mut self, post: &ListingPost) -> Result<(), StoreError>;

    /// Locks the cache row for `business_ref`, inserting an empty one first
    /// when none exists so concurrent claimers queue on the same row.
    async fn lock_business(&mut self, business_ref: &str)
        -> Result<BusinessPhoneCache, StoreError>;
    /// Unlocked cache row whose title is missing or was fetched at or before
    /// `stale_before`, missing titles first.
    async fn lock_next_stale_title(
        &mut self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<BusinessPhoneCache>, StoreError>;
    async fn save_business(&mut self, entry: &BusinessPhoneCache) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}

/// Selection window for the transfer reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferFilter {
    pub now: DateTime<Utc>,
    /// Only records fetched strictly after this instant; `None` disables the window.
    pub fetched_after: Option<DateTime<Utc>>,
    /// Skip records deferred past `now`.
    pub honor_defer: bool,
}

impl TransferFilter {
    /// An IN_PROGRESS record whose claim lapsed counts as free again.
    pub fn admits(&self, record: &HarvestedRecord) -> bool {
        record.status != TransferStatus::Transferred
            && self.fetched_after.map_or(true, |after| record.fetched_at > after)
            && !lock_is_live(record.transfer_locked_until, self.now)
            && (!self.honor_defer || !lock_is_live(record.next_transfer_attempt_at, self.now))
    }

    /// Catch-up predicate: anything not yet transferred that carries a real phone.
    pub fn admits_catch_up(&self, record: &HarvestedRecord) -> bool {
        record.status != TransferStatus::Transferred
            && record
                .phone_number
                .as_deref()
                .is_some_and(|phone| phone != SENTINEL_PHONE)
            && self.fetched_after.map_or(true, |after| record.fetched_at > after)
            && !lock_is_live(record.transfer_locked_until, self.now)
    }
}

pub fn is_lease_candidate(post: &ListingPost, now: DateTime<Utc>, max_attempts: i32) -> bool {
    post.contact_uuid.is_some()
        && post.phone_number.is_none()
        && post.phone_fetch_attempt_count < max_attempts
        && post.phone_fetch_status != PhoneFetchStatus::Done
        && !lock_is_live(post.phone_fetch_locked_until, now)
}
