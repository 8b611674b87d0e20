//! Lease Broker: one outstanding phone-fetch task per post.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use lpf_core::{usable_phone, ListingPost, PhoneFetchStatus};
use lpf_storage::{Store, StoreTx};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::business::{resolve_business, TitleLookup};
use crate::config::LeaseConfig;
use crate::invalidation::{notify_best_effort, InvalidationHook};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessCacheState {
    /// No cache row or no phone cached yet.
    Missing,
    /// A phone is cached but past its TTL.
    Stale,
}

/// Task handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseGrant {
    pub lease_id: Uuid,
    pub post_id: i64,
    pub external_id: Option<String>,
    pub contact_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_cache_state: Option<BusinessCacheState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_business_title: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Granted(LeaseGrant),
    /// No eligible post.
    Empty,
    /// The candidate was completed from a fresh business cache entry.
    ResolvedFromCache { post_id: i64 },
    /// Another lease or the title sweep holds the business cache row; the
    /// candidate went back to PENDING.
    BusinessBusy { post_id: i64 },
}

impl LeaseOutcome {
    pub fn grant(&self) -> Option<&LeaseGrant> {
        match self {
            Self::Granted(grant) => Some(grant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Applied { post_ids: Vec<i64> },
    /// Unknown, consumed or expired lease; nothing changed.
    StaleLease,
}

pub struct LeaseBroker<S: Store> {
    store: S,
    titles: TitleLookup,
    invalidation: Arc<dyn InvalidationHook>,
    config: LeaseConfig,
}

impl<S: Store> LeaseBroker<S> {
    pub fn new(
        store: S,
        titles: TitleLookup,
        invalidation: Arc<dyn InvalidationHook>,
        config: LeaseConfig,
    ) -> Self {
        Self {
            store,
            titles,
            invalidation,
            config,
        }
    }

    pub async fn lease(&self, worker_id: Option<String>) -> Result<LeaseOutcome> {
        self.lease_at(Utc::now(), worker_id).await
    }

    pub async fn lease_at(
        &self,
        now: DateTime<Utc>,
        worker_id: Option<String>,
    ) -> Result<LeaseOutcome> {
        let mut tx = self.store.begin().await?;
        let Some(mut post) = tx
            .lock_next_lease_candidate(now, self.config.max_attempts)
            .await?
        else {
            return Ok(LeaseOutcome::Empty);
        };

        let mut cache_state = None;
        let mut needs_title = None;
        if let Some(business_ref) = resolve_business(&mut post) {
            let mut entry = tx.lock_business(&business_ref).await?;

            if let Some(phone) = entry.fresh_phone(self.config.phone_ttl, now) {
                post.complete_with_phone(Some(phone.to_string()));
                tx.save_post(&post).await?;
                tx.commit().await?;
                info!(post_id = post.id, business_ref = %business_ref, "post completed from business cache");
                notify_best_effort(self.invalidation.as_ref(), &[post.id]).await;
                return Ok(LeaseOutcome::ResolvedFromCache { post_id: post.id });
            }

            if entry.is_locked(now) {
                post.phone_fetch_status = PhoneFetchStatus::Pending;
                tx.save_post(&post).await?;
                tx.commit().await?;
                debug!(post_id = post.id, business_ref = %business_ref, "business cache busy");
                return Ok(LeaseOutcome::BusinessBusy { post_id: post.id });
            }

            cache_state = Some(if entry.phone_number.is_some() {
                BusinessCacheState::Stale
            } else {
                BusinessCacheState::Missing
            });
            needs_title = Some(!entry.title_is_fresh(self.config.title_ttl, now));
            entry.locked_until = Some(now + self.config.lock);
            tx.save_business(&entry).await?;
        }

        let lease_id = Uuid::new_v4();
        post.phone_fetch_status = PhoneFetchStatus::InProgress;
        post.phone_fetch_locked_until = Some(now + self.config.lock);
        post.phone_fetch_lease_id = Some(lease_id);
        post.phone_fetch_worker = worker_id;
        post.phone_fetch_attempt_count += 1;
        post.phone_fetch_last_error = None;
        tx.save_post(&post).await?;
        tx.commit().await?;

        info!(
            post_id = post.id,
            %lease_id,
            attempt = post.phone_fetch_attempt_count,
            "phone fetch lease granted"
        );
        Ok(LeaseOutcome::Granted(LeaseGrant {
            lease_id,
            post_id: post.id,
            external_id: post.external_id,
            contact_uuid: post.contact_uuid,
            business_ref: post.business_ref,
            business_type: post.business_type,
            business_cache_state: cache_state,
            post_title: post.title,
            needs_business_title: needs_title,
        }))
    }

    pub async fn report_ok(
        &self,
        lease_id: Uuid,
        phone_number: &str,
        business_title: Option<String>,
    ) -> Result<ReportOutcome> {
        self.report_ok_at(Utc::now(), lease_id, phone_number, business_title)
            .await
    }

    pub async fn report_ok_at(
        &self,
        now: DateTime<Utc>,
        lease_id: Uuid,
        phone_number: &str,
        business_title: Option<String>,
    ) -> Result<ReportOutcome> {
        let Some(leased) = self.live_post(now, lease_id).await? else {
            debug!(%lease_id, "ignoring report for stale lease");
            return Ok(ReportOutcome::StaleLease);
        };

        let title = match (&leased.business_ref, business_title) {
            (_, Some(title)) => Some(title),
            (Some(business_ref), None) => {
                self.titles
                    .lookup(business_ref, leased.business_type.as_deref())
                    .await
            }
            (None, None) => None,
        };
        let phone = usable_phone(Some(phone_number));

        // Siblings are locked together with the leased post, in id order, so
        // concurrent reports for one business queue instead of deadlocking.
        let fan_out = phone.as_ref().and(leased.business_ref.as_deref());
        let mut tx = self.store.begin().await?;
        let locked = tx.lock_lease_targets(lease_id, fan_out).await?;
        let Some(post) = locked
            .iter()
            .find(|p| p.phone_fetch_lease_id == Some(lease_id))
            .cloned()
        else {
            return Ok(ReportOutcome::StaleLease);
        };
        if !post.has_live_lease(now) {
            return Ok(ReportOutcome::StaleLease);
        }

        let business_ref = post.business_ref.clone();
        let targets: BTreeMap<i64, ListingPost> = locked
            .into_iter()
            .filter(|p| {
                p.id == post.id
                    || (phone.is_some() && business_ref.is_some() && p.business_ref == business_ref)
            })
            .map(|p| (p.id, p))
            .collect();

        let mut post_ids = Vec::with_capacity(targets.len());
        for (id, mut target) in targets {
            target.complete_with_phone(phone.clone());
            tx.save_post(&target).await?;
            post_ids.push(id);
        }

        if let Some(business_ref) = &business_ref {
            let mut entry = tx.lock_business(business_ref).await?;
            match &phone {
                Some(phone) => entry.record_phone(phone.clone(), now),
                None => entry.locked_until = None,
            }
            if let Some(title) = &title {
                entry.title = Some(title.clone());
                entry.title_fetched_at = Some(now);
            }
            tx.save_business(&entry).await?;
        }
        tx.commit().await?;

        info!(%lease_id, posts = post_ids.len(), has_phone = phone.is_some(), "lease reported ok");
        notify_best_effort(self.invalidation.as_ref(), &post_ids).await;
        Ok(ReportOutcome::Applied { post_ids })
    }

    pub async fn report_error(&self, lease_id: Uuid, error: &str) -> Result<ReportOutcome> {
        self.report_error_at(Utc::now(), lease_id, error).await
    }

    pub async fn report_error_at(
        &self,
        now: DateTime<Utc>,
        lease_id: Uuid,
        error: &str,
    ) -> Result<ReportOutcome> {
        let mut tx = self.store.begin().await?;
        let Some(mut post) = tx.lock_post_by_lease(lease_id).await? else {
            return Ok(ReportOutcome::StaleLease);
        };
        if !post.has_live_lease(now) {
            return Ok(ReportOutcome::StaleLease);
        }

        post.phone_fetch_status = PhoneFetchStatus::Failed;
        post.phone_fetch_lease_id = None;
        post.phone_fetch_worker = None;
        post.phone_fetch_locked_until = Some(now);
        post.phone_fetch_last_error = Some(error.to_string());
        tx.save_post(&post).await?;

        if let Some(business_ref) = &post.business_ref {
            let mut entry = tx.lock_business(business_ref).await?;
            entry.locked_until = None;
            tx.save_business(&entry).await?;
        }
        tx.commit().await?;

        warn!(
            %lease_id,
            post_id = post.id,
            attempts = post.phone_fetch_attempt_count,
            error,
            "lease reported error"
        );
        Ok(ReportOutcome::Applied {
            post_ids: vec![post.id],
        })
    }

    /// Post holding a live `lease_id`, read in a throwaway transaction.
    async fn live_post(&self, now: DateTime<Utc>, lease_id: Uuid) -> Result<Option<ListingPost>> {
        let mut tx = self.store.begin().await?;
        let post = tx.lock_post_by_lease(lease_id).await?;
        drop(tx);
        Ok(post.filter(|p| p.has_live_lease(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::recording::RecordingInvalidation;
    use chrono::Duration;
    use lpf_core::{BusinessPhoneCache, ServiceKind};
    use lpf_storage::testing::ScriptedCatalog;
    use lpf_storage::{CatalogResponse, MemorySessions, MemoryStore};
    use serde_json::json;

    struct Harness {
        store: MemoryStore,
        catalog: Arc<ScriptedCatalog>,
        invalidation: Arc<RecordingInvalidation>,
        broker: LeaseBroker<MemoryStore>,
    }

    fn harness() -> Harness {
        let store = MemoryStore::new();
        let catalog = Arc::new(ScriptedCatalog::new());
        let sessions = Arc::new(MemorySessions::new());
        sessions.insert(ServiceKind::Marketplace, [("Authorization", "Bearer m")]);
        let invalidation = Arc::new(RecordingInvalidation::default());
        let broker = LeaseBroker::new(
            store.clone(),
            TitleLookup::new(catalog.clone(), sessions),
            invalidation.clone(),
            LeaseConfig::default(),
        );
        Harness {
            store,
            catalog,
            invalidation,
            broker,
        }
    }

    fn post(id: i64, created_at: DateTime<Utc>) -> ListingPost {
        ListingPost {
            id,
            external_id: Some(format!("ext-{id}")),
            contact_uuid: Some(format!("contact-{id}")),
            title: Some(format!("Flat {id}")),
            phone_number: None,
            owner_name: None,
            phone_fetch_status: PhoneFetchStatus::Pending,
            phone_fetch_locked_until: None,
            phone_fetch_lease_id: None,
            phone_fetch_worker: None,
            phone_fetch_attempt_count: 0,
            phone_fetch_last_error: None,
            business_ref: None,
            business_type: None,
            raw_payload: None,
            created_at,
        }
    }

    fn granted(outcome: LeaseOutcome) -> LeaseGrant {
        match outcome {
            LeaseOutcome::Granted(grant) => grant,
            other => panic!("expected a grant, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn newest_candidate_is_leased_first() {
        let h = harness();
        let now = Utc::now();
        h.store.insert_post(post(1, now - Duration::hours(2))).await;
        h.store.insert_post(post(2, now - Duration::hours(1))).await;
        let mut no_contact = post(3, now);
        no_contact.contact_uuid = None;
        h.store.insert_post(no_contact).await;

        let grant = granted(h.broker.lease_at(now, Some("w1".into())).await.unwrap());
        assert_eq!(grant.post_id, 2);
        assert_eq!(grant.contact_uuid.as_deref(), Some("contact-2"));
        assert_eq!(grant.business_cache_state, None);

        let stored = h.store.post(2).await.unwrap();
        assert_eq!(stored.phone_fetch_status, PhoneFetchStatus::InProgress);
        assert_eq!(stored.phone_fetch_lease_id, Some(grant.lease_id));
        assert_eq!(stored.phone_fetch_worker.as_deref(), Some("w1"));
        assert_eq!(stored.phone_fetch_attempt_count, 1);
        assert_eq!(stored.phone_fetch_locked_until, Some(now + Duration::seconds(60)));
    }

    #[tokio::test]
    async fn rapid_leases_never_share_a_post() {
        let h = harness();
        let now = Utc::now();
        h.store.insert_post(post(1, now - Duration::minutes(2))).await;
        h.store.insert_post(post(2, now - Duration::minutes(1))).await;

        let (a, b) = tokio::join!(h.broker.lease_at(now, None), h.broker.lease_at(now, None));
        let (a, b) = (granted(a.unwrap()), granted(b.unwrap()));
        assert_ne!(a.post_id, b.post_id);
        assert_ne!(a.lease_id, b.lease_id);
        assert_eq!(h.broker.lease_at(now, None).await.unwrap(), LeaseOutcome::Empty);
    }

    #[tokio::test]
    async fn expired_lease_is_reissued_and_old_report_is_ignored() {
        let h = harness();
        let now = Utc::now();
        h.store.insert_post(post(1, now)).await;

        let first = granted(h.broker.lease_at(now, None).await.unwrap());
        let later = now + Duration::seconds(60);
        let second = granted(h.broker.lease_at(later, None).await.unwrap());
        assert_eq!(second.post_id, 1);
        assert_ne!(first.lease_id, second.lease_id);

        let stale = h
            .broker
            .report_ok_at(later, first.lease_id, "09120000000", None)
            .await
            .unwrap();
        assert_eq!(stale, ReportOutcome::StaleLease);
        assert!(h.store.post(1).await.unwrap().phone_number.is_none());
    }

    #[tokio::test]
    async fn attempts_cap_stops_leasing() {
        let h = harness();
        let now = Utc::now();
        let mut exhausted = post(1, now);
        exhausted.phone_fetch_status = PhoneFetchStatus::Failed;
        exhausted.phone_fetch_attempt_count = 5;
        h.store.insert_post(exhausted).await;

        assert_eq!(h.broker.lease_at(now, None).await.unwrap(), LeaseOutcome::Empty);
    }

    #[tokio::test]
    async fn fresh_cache_phone_completes_without_lease() {
        let h = harness();
        let now = Utc::now();
        let mut listing = post(1, now);
        listing.raw_payload = Some(json!({ "webengage": { "business_ref": "b-1" } }));
        h.store.insert_post(listing).await;
        let mut entry = BusinessPhoneCache::empty("b-1");
        entry.phone_number = Some("09121234567".into());
        entry.fetched_at = Some(now - Duration::days(6));
        h.store.insert_business(entry).await;

        let outcome = h.broker.lease_at(now, None).await.unwrap();
        assert_eq!(outcome, LeaseOutcome::ResolvedFromCache { post_id: 1 });
        let stored = h.store.post(1).await.unwrap();
        assert_eq!(stored.phone_number.as_deref(), Some("09121234567"));
        assert_eq!(stored.phone_fetch_status, PhoneFetchStatus::Done);
        assert_eq!(stored.business_ref.as_deref(), Some("b-1"));
        assert_eq!(h.invalidation.all_ids(), vec![1]);
    }

    #[tokio::test]
    async fn cache_phone_at_exact_ttl_is_stale() {
        let h = harness();
        let now = Utc::now();
        let mut listing = post(1, now);
        listing.business_ref = Some("b-1".into());
        h.store.insert_post(listing).await;
        let mut entry = BusinessPhoneCache::empty("b-1");
        entry.phone_number = Some("09121234567".into());
        entry.fetched_at = Some(now - Duration::days(7));
        h.store.insert_business(entry).await;

        let grant = granted(h.broker.lease_at(now, None).await.unwrap());
        assert_eq!(grant.business_cache_state, Some(BusinessCacheState::Stale));
        assert_eq!(grant.needs_business_title, Some(true));
        let entry = h.store.business("b-1").await.unwrap();
        assert_eq!(entry.locked_until, Some(now + Duration::seconds(60)));
    }

    #[tokio::test]
    async fn locked_cache_row_sends_post_back_to_pending() {
        let h = harness();
        let now = Utc::now();
        let mut first = post(1, now - Duration::minutes(1));
        first.business_ref = Some("b-1".into());
        let mut second = post(2, now);
        second.business_ref = Some("b-1".into());
        h.store.insert_post(first).await;
        h.store.insert_post(second).await;

        let grant = granted(h.broker.lease_at(now, None).await.unwrap());
        assert_eq!(grant.post_id, 2);
        assert_eq!(grant.business_cache_state, Some(BusinessCacheState::Missing));

        let busy = h.broker.lease_at(now, None).await.unwrap();
        assert_eq!(busy, LeaseOutcome::BusinessBusy { post_id: 1 });
        let stored = h.store.post(1).await.unwrap();
        assert_eq!(stored.phone_fetch_status, PhoneFetchStatus::Pending);
        assert!(stored.phone_fetch_lease_id.is_none());
    }

    #[tokio::test]
    async fn report_ok_fans_out_to_business_siblings_and_caches() {
        let h = harness();
        let now = Utc::now();
        let mut leased = post(1, now);
        leased.business_ref = Some("b-1".into());
        leased.business_type = Some("agency".into());
        let mut sibling = post(2, now - Duration::days(1));
        sibling.business_ref = Some("b-1".into());
        h.store.insert_post(leased).await;
        h.store.insert_post(sibling).await;
        h.catalog.set_brand(
            "b-1",
            Ok(CatalogResponse::json(200, json!({ "data": { "brand": { "name": "Atlas" } } }))),
        );

        let grant = granted(h.broker.lease_at(now, Some("w".into())).await.unwrap());
        assert_eq!(grant.post_id, 1);
        let outcome = h
            .broker
            .report_ok_at(now, grant.lease_id, "0912-765-4321", None)
            .await
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Applied { post_ids: vec![1, 2] });

        for id in [1, 2] {
            let stored = h.store.post(id).await.unwrap();
            assert_eq!(stored.phone_number.as_deref(), Some("09127654321"));
            assert_eq!(stored.phone_fetch_status, PhoneFetchStatus::Done);
            assert!(stored.phone_fetch_lease_id.is_none());
        }
        let entry = h.store.business("b-1").await.unwrap();
        assert_eq!(entry.phone_number.as_deref(), Some("09127654321"));
        assert_eq!(entry.fetched_at, Some(now));
        assert!(entry.locked_until.is_none());
        assert_eq!(entry.title.as_deref(), Some("Atlas"));
        assert_eq!(h.catalog.brand_calls(), vec!["b-1".to_string()]);
        assert_eq!(h.invalidation.all_ids(), vec![1, 2]);

        let repeat = h
            .broker
            .report_ok_at(now, grant.lease_id, "09127654321", None)
            .await
            .unwrap();
        assert_eq!(repeat, ReportOutcome::StaleLease);
    }

    #[tokio::test]
    async fn concurrent_leases_on_one_new_business_grant_once() {
        let h = harness();
        let now = Utc::now();
        for id in [1, 2] {
            let mut listing = post(id, now - Duration::minutes(id));
            listing.business_ref = Some("b-new".into());
            h.store.insert_post(listing).await;
        }

        let (a, b) = tokio::join!(h.broker.lease_at(now, None), h.broker.lease_at(now, None));
        let outcomes = [a.unwrap(), b.unwrap()];
        let grants = outcomes.iter().filter(|o| o.grant().is_some()).count();
        assert_eq!(grants, 1, "{outcomes:?}");
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, LeaseOutcome::BusinessBusy { .. })));
        let entry = h.store.business("b-new").await.unwrap();
        assert_eq!(entry.locked_until, Some(now + Duration::seconds(60)));
    }

    #[tokio::test]
    async fn concurrent_sibling_reports_both_settle() {
        let h = harness();
        let now = Utc::now();
        let leases = [Uuid::new_v4(), Uuid::new_v4()];
        for (id, lease_id) in [(1, leases[0]), (2, leases[1])] {
            let mut listing = post(id, now);
            listing.business_ref = Some("b-1".into());
            listing.phone_fetch_status = PhoneFetchStatus::InProgress;
            listing.phone_fetch_lease_id = Some(lease_id);
            listing.phone_fetch_locked_until = Some(now + Duration::seconds(60));
            h.store.insert_post(listing).await;
        }

        let (a, b) = tokio::join!(
            h.broker.report_ok_at(now, leases[0], "09121230000", Some("Atlas".into())),
            h.broker.report_ok_at(now, leases[1], "09121230000", Some("Atlas".into())),
        );
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, ReportOutcome::StaleLease));
        assert_eq!(
            outcomes,
            vec![
                ReportOutcome::Applied { post_ids: vec![1, 2] },
                ReportOutcome::StaleLease
            ]
        );
        for id in [1, 2] {
            let stored = h.store.post(id).await.unwrap();
            assert_eq!(stored.phone_number.as_deref(), Some("09121230000"));
            assert_eq!(stored.phone_fetch_status, PhoneFetchStatus::Done);
        }
    }

    #[tokio::test]
    async fn sentinel_report_completes_post_without_phone() {
        let h = harness();
        let now = Utc::now();
        let mut leased = post(1, now);
        leased.business_ref = Some("b-1".into());
        let mut sibling = post(2, now - Duration::hours(1));
        sibling.business_ref = Some("b-1".into());
        h.store.insert_post(leased).await;
        h.store.insert_post(sibling).await;

        let grant = granted(h.broker.lease_at(now, None).await.unwrap());
        assert_eq!(grant.post_id, 1);
        let outcome = h
            .broker
            .report_ok_at(now, grant.lease_id, "09000000000", Some("Atlas".into()))
            .await
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Applied { post_ids: vec![1] });

        let stored = h.store.post(1).await.unwrap();
        assert_eq!(stored.phone_number, None);
        assert_eq!(stored.phone_fetch_status, PhoneFetchStatus::Done);
        assert!(stored.phone_fetch_lease_id.is_none());

        let untouched = h.store.post(2).await.unwrap();
        assert_eq!(untouched.phone_number, None);
        assert_eq!(untouched.phone_fetch_status, PhoneFetchStatus::Pending);

        let entry = h.store.business("b-1").await.unwrap();
        assert_eq!(entry.phone_number, None);
        assert!(entry.fetched_at.is_none());
        assert!(entry.locked_until.is_none());
        assert_eq!(h.invalidation.all_ids(), vec![1]);
    }

    #[tokio::test]
    async fn supplied_title_skips_lookup() {
        let h = harness();
        let now = Utc::now();
        let mut leased = post(1, now);
        leased.business_ref = Some("b-2".into());
        h.store.insert_post(leased).await;

        let grant = granted(h.broker.lease_at(now, None).await.unwrap());
        h.broker
            .report_ok_at(now, grant.lease_id, "09121112233", Some("Given".into()))
            .await
            .unwrap();
        assert!(h.catalog.brand_calls().is_empty());
        assert_eq!(
            h.store.business("b-2").await.unwrap().title.as_deref(),
            Some("Given")
        );
    }

    #[tokio::test]
    async fn report_error_fails_post_and_releases_cache() {
        let h = harness();
        let now = Utc::now();
        let mut leased = post(1, now);
        leased.business_ref = Some("b-1".into());
        h.store.insert_post(leased).await;

        let grant = granted(h.broker.lease_at(now, None).await.unwrap());
        let outcome = h
            .broker
            .report_error_at(now, grant.lease_id, "contact hidden")
            .await
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Applied { post_ids: vec![1] });

        let stored = h.store.post(1).await.unwrap();
        assert_eq!(stored.phone_fetch_status, PhoneFetchStatus::Failed);
        assert_eq!(stored.phone_fetch_locked_until, Some(now));
        assert!(stored.phone_fetch_lease_id.is_none());
        assert_eq!(stored.phone_fetch_last_error.as_deref(), Some("contact hidden"));
        assert!(h.store.business("b-1").await.unwrap().locked_until.is_none());

        let retry = granted(h.broker.lease_at(now, None).await.unwrap());
        assert_eq!(retry.post_id, 1);
        assert_eq!(h.store.post(1).await.unwrap().phone_fetch_attempt_count, 2);
    }
}
