//! Transfer Reconciler: copies harvested phone/owner data onto listing posts.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use lpf_core::{usable_phone, HarvestedRecord, ListingPost, TransferStatus};
use lpf_storage::{Store, StoreTx, TransferFilter};
use serde::Serialize;
use tracing::{debug, info};

use crate::business::resolve_business;
use crate::config::TransferConfig;
use crate::invalidation::{notify_best_effort, InvalidationHook};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferOutcome {
    Idle,
    Transferred { arka_id: i64, post_id: i64 },
    Deferred { arka_id: i64, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatchUpSummary {
    pub batches: usize,
    pub transferred: usize,
    pub post_ids: Vec<i64>,
}

/// Writes one matched record onto its post inside `tx`: phone (sentinel
/// suppressed, existing phone kept when none is usable), owner, DONE state,
/// business cache, and marks the record transferred.
async fn apply_match<T: StoreTx>(
    tx: &mut T,
    record: &mut HarvestedRecord,
    post: &mut ListingPost,
    now: DateTime<Utc>,
) -> Result<()> {
    let phone = usable_phone(record.phone_number.as_deref());
    post.complete_with_phone(phone.clone());
    if let Some(owner) = &record.owner_name {
        post.owner_name = Some(owner.clone());
    }
    let business_ref = resolve_business(post);
    tx.save_post(post).await?;

    if let (Some(business_ref), Some(phone)) = (business_ref, phone) {
        let mut entry = tx.lock_business(&business_ref).await?;
        entry.record_phone(phone, now);
        tx.save_business(&entry).await?;
    }

    record.status = TransferStatus::Transferred;
    record.transferred_at = Some(now);
    record.transfer_locked_until = None;
    record.next_transfer_attempt_at = None;
    record.transfer_last_error = None;
    tx.save_harvested(record).await?;
    Ok(())
}

pub struct TransferReconciler<S: Store> {
    store: S,
    invalidation: Arc<dyn InvalidationHook>,
    config: TransferConfig,
}

impl<S: Store> TransferReconciler<S> {
    pub fn new(store: S, invalidation: Arc<dyn InvalidationHook>, config: TransferConfig) -> Self {
        Self {
            store,
            invalidation,
            config,
        }
    }

    fn filter(&self, now: DateTime<Utc>, force: bool) -> TransferFilter {
        TransferFilter {
            now,
            fetched_after: (!force).then(|| now - self.config.window),
            honor_defer: !force,
        }
    }

    pub async fn transfer_one(&self, force: bool) -> Result<TransferOutcome> {
        self.transfer_one_at(Utc::now(), force).await
    }

    /// Claims the oldest admissible record and matches it against posts in
    /// one transaction. `force` ignores the fetch window and deferrals.
    pub async fn transfer_one_at(&self, now: DateTime<Utc>, force: bool) -> Result<TransferOutcome> {
        let mut tx = self.store.begin().await?;
        let Some(mut record) = tx.lock_next_transferable(&self.filter(now, force)).await? else {
            return Ok(TransferOutcome::Idle);
        };
        record.status = TransferStatus::InProgress;
        record.transfer_locked_until = Some(now + self.config.lock);
        record.transfer_attempt_count += 1;

        let arka_id = record.arka_id;
        let post = match record.external_id.clone() {
            Some(external_id) => tx.lock_post_by_external_id(&external_id).await?,
            None => None,
        };

        let Some(mut post) = post else {
            let reason = if record.external_id.is_none() {
                "missing_external_id"
            } else {
                "post_not_found"
            };
            record.status = TransferStatus::NotTransferred;
            record.transfer_locked_until = None;
            record.next_transfer_attempt_at = Some(now + self.config.defer);
            record.transfer_last_error = Some(reason.to_string());
            tx.save_harvested(&record).await?;
            tx.commit().await?;
            debug!(arka_id, reason, "transfer deferred");
            return Ok(TransferOutcome::Deferred {
                arka_id,
                reason: reason.to_string(),
            });
        };

        apply_match(&mut tx, &mut record, &mut post, now).await?;
        tx.commit().await?;
        info!(arka_id, post_id = post.id, "transferred harvested record");
        notify_best_effort(self.invalidation.as_ref(), &[post.id]).await;
        Ok(TransferOutcome::Transferred {
            arka_id,
            post_id: post.id,
        })
    }

    pub async fn transfer_missing_posts(&self, force: bool) -> Result<CatchUpSummary> {
        self.transfer_missing_posts_at(Utc::now(), force).await
    }

    /// Bulk catch-up: phone-bearing records joined to phoneless posts, one
    /// transaction per batch until a batch comes back empty.
    pub async fn transfer_missing_posts_at(
        &self,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<CatchUpSummary> {
        let filter = self.filter(now, force);
        let mut summary = CatchUpSummary::default();

        while summary.batches < self.config.max_batches {
            let mut tx = self.store.begin().await?;
            let matches = tx
                .lock_missing_post_matches(&filter, self.config.batch_size)
                .await?;
            if matches.is_empty() {
                break;
            }

            let mut batch_ids = Vec::with_capacity(matches.len());
            for (mut record, mut post) in matches {
                apply_match(&mut tx, &mut record, &mut post, now).await?;
                batch_ids.push(post.id);
            }
            tx.commit().await?;

            summary.batches += 1;
            summary.transferred += batch_ids.len();
            debug!(batch = summary.batches, rows = batch_ids.len(), "catch-up batch applied");
            notify_best_effort(self.invalidation.as_ref(), &batch_ids).await;
            summary.post_ids.extend(batch_ids);
        }

        if summary.transferred > 0 {
            info!(
                batches = summary.batches,
                transferred = summary.transferred,
                "catch-up transfer finished"
            );
        }
        Ok(summary)
    }
}
