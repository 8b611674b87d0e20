//! Scripted [`CatalogApi`] for exercising the pipeline without the network.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::http::{CatalogApi, CatalogError, CatalogResponse};
use crate::session::SessionHeaders;

type Scripted = Result<CatalogResponse, CatalogError>;

fn clone_scripted(value: &Scripted) -> Scripted {
    match value {
        Ok(resp) => Ok(resp.clone()),
        Err(CatalogError::Transport(msg)) => Err(CatalogError::Transport(msg.clone())),
    }
}

/// Fetch responses are consumed in order; an exhausted queue answers 404.
/// Without a scripted latest-ids answer the latest-ids call fails at the transport level.
#[derive(Debug, Default)]
pub struct ScriptedCatalog {
    fetches: Mutex<VecDeque<Scripted>>,
    latest: Mutex<Option<Scripted>>,
    brands: Mutex<HashMap<String, Scripted>>,
    fetch_delay: Mutex<Option<Duration>>,
    fetched_ids: Mutex<Vec<i64>>,
    brand_calls: Mutex<Vec<String>>,
}

impl ScriptedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_fetch(&self, response: Scripted) -> &Self {
        self.fetches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
        self
    }

    /// Every fetch-by-id call sleeps this long before answering.
    pub fn set_fetch_delay(&self, delay: Duration) -> &Self {
        *self.fetch_delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
        self
    }

    pub fn set_latest(&self, response: Scripted) -> &Self {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(response);
        self
    }

    pub fn set_brand(&self, business_ref: &str, response: Scripted) -> &Self {
        self.brands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(business_ref.to_string(), response);
        self
    }

    pub fn fetched_ids(&self) -> Vec<i64> {
        self.fetched_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn brand_calls(&self) -> Vec<String> {
        self.brand_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CatalogApi for ScriptedCatalog {
    async fn latest_ids(&self, _session: &SessionHeaders) -> Result<CatalogResponse, CatalogError> {
        match self.latest.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(scripted) => clone_scripted(scripted),
            None => Err(CatalogError::Transport("no latest-ids script".into())),
        }
    }

    async fn fetch_record(
        &self,
        _session: &SessionHeaders,
        arka_id: i64,
    ) -> Result<CatalogResponse, CatalogError> {
        self.fetched_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(arka_id);
        let delay = *self.fetch_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.fetches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Ok(CatalogResponse::status_only(404)))
    }

    async fn business_brand(
        &self,
        _session: &SessionHeaders,
        business_ref: &str,
        _business_type: Option<&str>,
    ) -> Result<CatalogResponse, CatalogError> {
        self.brand_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(business_ref.to_string());
        match self
            .brands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(business_ref)
        {
            Some(scripted) => clone_scripted(scripted),
            None => Ok(CatalogResponse::status_only(404)),
        }
    }
}
