//! Outbound calls to the phone catalog and the marketplace brand endpoint.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

use crate::session::SessionHeaders;

/// How the pipeline reacts to a catalog status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    NotFound,
    RateLimited,
    /// 401, 403 and 412 (locked account).
    Unauthorized,
    Upstream,
}

pub fn classify_status(status: StatusCode) -> ResponseClass {
    if status.is_success() {
        ResponseClass::Success
    } else if status == StatusCode::NOT_FOUND {
        ResponseClass::NotFound
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ResponseClass::RateLimited
    } else if matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::PRECONDITION_FAILED
    ) {
        ResponseClass::Unauthorized
    } else {
        ResponseClass::Upstream
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogResponse {
    pub status: StatusCode,
    pub body: Option<JsonValue>,
}

impl CatalogResponse {
    pub fn json(status: u16, body: JsonValue) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body: Some(body),
        }
    }

    pub fn status_only(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body: None,
        }
    }

    pub fn class(&self) -> ResponseClass {
        classify_status(self.status)
    }
}

/// No response was obtained at all.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("transport failure: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for CatalogError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// "List latest ids" lookup.
    async fn latest_ids(&self, session: &SessionHeaders) -> Result<CatalogResponse, CatalogError>;

    /// "Fetch by sequential id".
    async fn fetch_record(
        &self,
        session: &SessionHeaders,
        arka_id: i64,
    ) -> Result<CatalogResponse, CatalogError>;

    /// Marketplace business brand lookup used for title resolution.
    async fn business_brand(
        &self,
        session: &SessionHeaders,
        business_ref: &str,
        business_type: Option<&str>,
    ) -> Result<CatalogResponse, CatalogError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogEndpoints {
    pub latest_ids_url: String,
    pub fetch_by_id_url: String,
    pub brand_lookup_url: String,
}

#[derive(Debug, Clone)]
pub struct HttpCatalogClient {
    client: reqwest::Client,
    endpoints: CatalogEndpoints,
}

impl HttpCatalogClient {
    pub fn new(config: HttpClientConfig, endpoints: CatalogEndpoints) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, endpoints })
    }

    async fn post_json(
        &self,
        url: &str,
        session: &SessionHeaders,
        body: JsonValue,
    ) -> Result<CatalogResponse, CatalogError> {
        let resp = self
            .client
            .post(url)
            .headers(request_headers(session))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        let body = if bytes.is_empty() {
            None
        } else {
            serde_json::from_slice::<JsonValue>(&bytes).ok()
        };
        debug!(%status, bytes = bytes.len(), "catalog response");
        Ok(CatalogResponse { status, body })
    }
}

/// Session headers as a map, one value per name. Malformed entries are dropped.
fn request_headers(session: &SessionHeaders) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(session.headers.len());
    for (name, value) in &session.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => debug!(header = %name, "dropping malformed session header"),
        }
    }
    headers
}

#[async_trait]
impl CatalogApi for HttpCatalogClient {
    async fn latest_ids(&self, session: &SessionHeaders) -> Result<CatalogResponse, CatalogError> {
        let span = info_span!("catalog_latest_ids", session_id = session.session_id);
        self.post_json(&self.endpoints.latest_ids_url, session, json!({}))
            .instrument(span)
            .await
    }

    async fn fetch_record(
        &self,
        session: &SessionHeaders,
        arka_id: i64,
    ) -> Result<CatalogResponse, CatalogError> {
        let span = info_span!("catalog_fetch", arka_id, session_id = session.session_id);
        self.post_json(&self.endpoints.fetch_by_id_url, session, json!({ "id": arka_id }))
            .instrument(span)
            .await
    }

    async fn business_brand(
        &self,
        session: &SessionHeaders,
        business_ref: &str,
        business_type: Option<&str>,
    ) -> Result<CatalogResponse, CatalogError> {
        let span = info_span!("brand_lookup", business_ref, session_id = session.session_id);
        self.post_json(
            &self.endpoints.brand_lookup_url,
            session,
            json!({ "business_ref": business_ref, "business_type": business_type }),
        )
        .instrument(span)
        .await
    }
}
