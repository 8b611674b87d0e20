//! Persistence and outbound HTTP for the listing phone pipeline.
//!
//! Every cross-process claim is a conditional write inside a [`StoreTx`]; the
//! PostgreSQL store takes row locks, the in-memory store serializes whole
//! transactions.

pub mod http;
pub mod memory;
pub mod postgres;
pub mod session;
pub mod store;
pub mod testing;

use thiserror::Error;

pub use http::{
    classify_status, CatalogApi, CatalogEndpoints, CatalogError, CatalogResponse,
    HttpCatalogClient, HttpClientConfig, ResponseClass,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use session::{MemorySessions, PgSessionProvider, SessionHeaders, SessionProvider};
pub use store::{Store, StoreTx, TransferFilter};

pub const CRATE_NAME: &str = "lpf-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
