//! Fetch, lease and transfer orchestration for the listing phone pipeline.

pub mod business;
pub mod config;
pub mod cursor;
pub mod invalidation;
pub mod lease;
pub mod scheduler;
pub mod transfer;

use std::sync::Arc;

use anyhow::{Context, Result};
use lpf_storage::{
    CatalogApi, HttpCatalogClient, PgSessionProvider, PgStore, SessionProvider, Store,
};
use tracing::{error, info_span, Instrument};

pub use business::{resolve_business, TitleLookup, TitleSweepOutcome, TitleSweeper};
pub use config::{
    BusinessCacheConfig, CursorConfig, LeaseConfig, SchedulerConfig, SyncConfig, TransferConfig,
};
pub use cursor::{CursorFetcher, FetchOutcome, FetchTick};
pub use invalidation::{InvalidationHook, NoopInvalidation, WebhookInvalidation};
pub use lease::{BusinessCacheState, LeaseBroker, LeaseGrant, LeaseOutcome, ReportOutcome};
pub use scheduler::{maybe_build_scheduler, TickGuard, TickPermit};
pub use transfer::{CatchUpSummary, TransferOutcome, TransferReconciler};

pub const CRATE_NAME: &str = "lpf-sync";

/// All pipeline components over one store, plus a tick guard per periodic job.
pub struct Pipeline<S: Store> {
    pub fetcher: CursorFetcher<S>,
    pub leases: LeaseBroker<S>,
    pub titles: TitleSweeper<S>,
    pub transfers: TransferReconciler<S>,
    fetch_guard: TickGuard,
    transfer_guard: TickGuard,
    transfer_missing_guard: TickGuard,
    title_guard: TickGuard,
}

impl<S: Store> Pipeline<S> {
    pub fn new(
        store: S,
        catalog: Arc<dyn CatalogApi>,
        sessions: Arc<dyn SessionProvider>,
        invalidation: Arc<dyn InvalidationHook>,
        config: &SyncConfig,
    ) -> Self {
        let lookup = TitleLookup::new(catalog.clone(), sessions.clone());
        let watchdog = config.scheduler.tick_watchdog;
        Self {
            fetcher: CursorFetcher::new(
                store.clone(),
                catalog,
                sessions,
                config.cursor.clone(),
                config.instance_id.clone(),
            ),
            leases: LeaseBroker::new(
                store.clone(),
                lookup.clone(),
                invalidation.clone(),
                config.lease.clone(),
            ),
            titles: TitleSweeper::new(store.clone(), lookup, config.business.clone()),
            transfers: TransferReconciler::new(store, invalidation, config.transfer.clone()),
            fetch_guard: TickGuard::new("fetch", watchdog),
            transfer_guard: TickGuard::new("transfer", watchdog),
            transfer_missing_guard: TickGuard::new("transfer_missing", watchdog),
            title_guard: TickGuard::new("title_sweep", watchdog),
        }
    }

    /// Guarded fetch tick. `None` when skipped by the guard or failed.
    pub async fn fetch_tick(&self) -> Option<FetchTick> {
        let _permit = self.fetch_guard.try_enter()?;
        match self
            .fetcher
            .tick()
            .instrument(info_span!("fetch_tick"))
            .await
        {
            Ok(tick) => Some(tick),
            Err(err) => {
                error!(error = %err, "fetch tick failed");
                None
            }
        }
    }

    pub async fn transfer_tick(&self) -> Option<TransferOutcome> {
        let _permit = self.transfer_guard.try_enter()?;
        match self
            .transfers
            .transfer_one(false)
            .instrument(info_span!("transfer_tick"))
            .await
        {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!(error = %err, "transfer tick failed");
                None
            }
        }
    }

    pub async fn transfer_missing_tick(&self) -> Option<CatchUpSummary> {
        let _permit = self.transfer_missing_guard.try_enter()?;
        match self
            .transfers
            .transfer_missing_posts(false)
            .instrument(info_span!("transfer_missing_tick"))
            .await
        {
            Ok(summary) => Some(summary),
            Err(err) => {
                error!(error = %err, "missing-post transfer failed");
                None
            }
        }
    }

    pub async fn title_sweep_tick(&self) -> Option<TitleSweepOutcome> {
        let _permit = self.title_guard.try_enter()?;
        match self
            .titles
            .sweep_once()
            .instrument(info_span!("title_sweep_tick"))
            .await
        {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!(error = %err, "title sweep failed");
                None
            }
        }
    }
}

pub fn invalidation_from_config(config: &SyncConfig) -> Result<Arc<dyn InvalidationHook>> {
    Ok(match &config.invalidation_url {
        Some(url) => Arc::new(WebhookInvalidation::new(url.clone(), config.http.timeout)?),
        None => Arc::new(NoopInvalidation),
    })
}

/// PostgreSQL-backed pipeline with the HTTP catalog client and stored sessions.
pub async fn connect_pipeline(config: &SyncConfig) -> Result<(Pipeline<PgStore>, PgStore)> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let catalog = HttpCatalogClient::new(config.http.clone(), config.endpoints.clone())?;
    let sessions = PgSessionProvider::new(store.pool().clone());
    let invalidation = invalidation_from_config(config)?;
    let pipeline = Pipeline::new(
        store.clone(),
        Arc::new(catalog),
        Arc::new(sessions),
        invalidation,
        config,
    );
    Ok((pipeline, store))
}
