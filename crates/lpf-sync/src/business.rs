//! Business-phone cache helpers: business resolution for posts, marketplace
//! title lookup and the slow title sweep.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use lpf_adapters::{brand_title, business_meta_from_payload};
use lpf_core::{ListingPost, ServiceKind};
use lpf_storage::{CatalogApi, ResponseClass, SessionProvider, Store, StoreTx};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::BusinessCacheConfig;

/// Fills `business_ref`/`business_type` from the raw payload when the post
/// columns are empty. Returns the resolved reference.
pub fn resolve_business(post: &mut ListingPost) -> Option<String> {
    if post.business_ref.is_none() || post.business_type.is_none() {
        if let Some(payload) = &post.raw_payload {
            let meta = business_meta_from_payload(payload);
            if post.business_ref.is_none() {
                post.business_ref = meta.business_ref;
            }
            if post.business_type.is_none() {
                post.business_type = meta.business_type;
            }
        }
    }
    post.business_ref.clone()
}

/// Marketplace brand lookup. Every failure degrades to `None`.
#[derive(Clone)]
pub struct TitleLookup {
    catalog: Arc<dyn CatalogApi>,
    sessions: Arc<dyn SessionProvider>,
}

impl TitleLookup {
    pub fn new(catalog: Arc<dyn CatalogApi>, sessions: Arc<dyn SessionProvider>) -> Self {
        Self { catalog, sessions }
    }

    pub async fn lookup(&self, business_ref: &str, business_type: Option<&str>) -> Option<String> {
        let session = match self.sessions.active_headers(ServiceKind::Marketplace).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!(business_ref, "no marketplace session for title lookup");
                return None;
            }
            Err(err) => {
                warn!(error = %err, business_ref, "loading marketplace session failed");
                return None;
            }
        };

        match self
            .catalog
            .business_brand(&session, business_ref, business_type)
            .await
        {
            Ok(resp) if resp.class() == ResponseClass::Success => {
                let title = resp.body.as_ref().and_then(brand_title);
                if title.is_none() {
                    debug!(business_ref, "brand lookup returned no title");
                }
                title
            }
            Ok(resp) => {
                debug!(business_ref, status = %resp.status, "brand lookup rejected");
                None
            }
            Err(err) => {
                warn!(error = %err, business_ref, "brand lookup failed");
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TitleSweepOutcome {
    Idle,
    Refreshed {
        business_ref: String,
        title: Option<String>,
        changed: bool,
    },
}

pub struct TitleSweeper<S: Store> {
    store: S,
    titles: TitleLookup,
    config: BusinessCacheConfig,
}

impl<S: Store> TitleSweeper<S> {
    pub fn new(store: S, titles: TitleLookup, config: BusinessCacheConfig) -> Self {
        Self {
            store,
            titles,
            config,
        }
    }

    pub async fn sweep_once(&self) -> Result<TitleSweepOutcome> {
        self.sweep_once_at(Utc::now()).await
    }

    /// Refreshes the title of at most one stale, unlocked cache row.
    pub async fn sweep_once_at(&self, now: DateTime<Utc>) -> Result<TitleSweepOutcome> {
        let claim = now + self.config.sweep_lock;
        let mut tx = self.store.begin().await?;
        let Some(mut entry) = tx
            .lock_next_stale_title(now, now - self.config.title_ttl)
            .await?
        else {
            return Ok(TitleSweepOutcome::Idle);
        };
        entry.locked_until = Some(claim);
        tx.save_business(&entry).await?;
        tx.commit().await?;

        let business_ref = entry.business_ref.clone();
        let fetched = self.titles.lookup(&business_ref, None).await;

        let mut tx = self.store.begin().await?;
        let mut entry = tx.lock_business(&business_ref).await?;
        let changed = fetched.is_some() && fetched != entry.title;
        if let Some(title) = &fetched {
            entry.title = Some(title.clone());
        }
        entry.title_fetched_at = Some(now);
        if entry.locked_until == Some(claim) {
            entry.locked_until = None;
        }
        tx.save_business(&entry).await?;
        tx.commit().await?;

        info!(business_ref = %business_ref, changed, "refreshed business title");
        Ok(TitleSweepOutcome::Refreshed {
            business_ref,
            title: entry.title,
            changed,
        })
    }
}
