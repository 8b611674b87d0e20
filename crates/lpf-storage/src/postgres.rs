use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lpf_core::{
    BusinessPhoneCache, FetchCursor, HarvestedRecord, ListingPost, PhoneFetchStatus,
    TransferStatus, CURSOR_KEY, SENTINEL_PHONE,
};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::store::{Store, StoreTx, TransferFilter};
use crate::StoreError;

const CURSOR_COLUMNS: &str = "id, next_fetch_id, locked_until, locked_by, backoff_until, \
     last_status, last_error, updated_at";

const RECORD_COLUMNS: &str = "arka_id, external_id, phone_number, owner_name, payload, status, \
     transfer_attempt_count, transfer_locked_until, next_transfer_attempt_at, \
     transfer_last_error, fetched_at, transferred_at";

const POST_COLUMNS: &str = "id, external_id, contact_uuid, title, phone_number, owner_name, \
     phone_fetch_status, phone_fetch_locked_until, phone_fetch_lease_id, phone_fetch_worker, \
     phone_fetch_attempt_count, phone_fetch_last_error, business_ref, business_type, \
     raw_payload, created_at";

const CACHE_COLUMNS: &str =
    "business_ref, phone_number, fetched_at, locked_until, title, title_fetched_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StoreError> {
        Ok(PgTx {
            tx: self.pool.begin().await?,
        })
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

fn cursor_from_row(row: &PgRow) -> Result<FetchCursor, StoreError> {
    Ok(FetchCursor {
        id: row.try_get("id")?,
        next_fetch_id: row.try_get("next_fetch_id")?,
        locked_until: row.try_get("locked_until")?,
        locked_by: row.try_get("locked_by")?,
        backoff_until: row.try_get("backoff_until")?,
        last_status: row.try_get("last_status")?,
        last_error: row.try_get("last_error")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn record_from_row(row: &PgRow) -> Result<HarvestedRecord, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(HarvestedRecord {
        arka_id: row.try_get("arka_id")?,
        external_id: row.try_get("external_id")?,
        phone_number: row.try_get("phone_number")?,
        owner_name: row.try_get("owner_name")?,
        payload: row.try_get("payload")?,
        status: status
            .parse::<TransferStatus>()
            .map_err(|err| StoreError::Corrupt {
                table: "harvested_records",
                detail: err.to_string(),
            })?,
        transfer_attempt_count: row.try_get("transfer_attempt_count")?,
        transfer_locked_until: row.try_get("transfer_locked_until")?,
        next_transfer_attempt_at: row.try_get("next_transfer_attempt_at")?,
        transfer_last_error: row.try_get("transfer_last_error")?,
        fetched_at: row.try_get("fetched_at")?,
        transferred_at: row.try_get("transferred_at")?,
    })
}

fn post_from_row(row: &PgRow) -> Result<ListingPost, StoreError> {
    let status: String = row.try_get("phone_fetch_status")?;
    Ok(ListingPost {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        contact_uuid: row.try_get("contact_uuid")?,
        title: row.try_get("title")?,
        phone_number: row.try_get("phone_number")?,
        owner_name: row.try_get("owner_name")?,
        phone_fetch_status: status
            .parse::<PhoneFetchStatus>()
            .map_err(|err| StoreError::Corrupt {
                table: "listing_posts",
                detail: err.to_string(),
            })?,
        phone_fetch_locked_until: row.try_get("phone_fetch_locked_until")?,
        phone_fetch_lease_id: row.try_get("phone_fetch_lease_id")?,
        phone_fetch_worker: row.try_get("phone_fetch_worker")?,
        phone_fetch_attempt_count: row.try_get("phone_fetch_attempt_count")?,
        phone_fetch_last_error: row.try_get("phone_fetch_last_error")?,
        business_ref: row.try_get("business_ref")?,
        business_type: row.try_get("business_type")?,
        raw_payload: row.try_get("raw_payload")?,
        created_at: row.try_get("created_at")?,
    })
}

fn cache_from_row(row: &PgRow) -> Result<BusinessPhoneCache, StoreError> {
    Ok(BusinessPhoneCache {
        business_ref: row.try_get("business_ref")?,
        phone_number: row.try_get("phone_number")?,
        fetched_at: row.try_get("fetched_at")?,
        locked_until: row.try_get("locked_until")?,
        title: row.try_get("title")?,
        title_fetched_at: row.try_get("title_fetched_at")?,
    })
}

/// Joined row: record columns prefixed `h_`, post columns prefixed `p_`.
fn prefixed(columns: &str, alias: &str) -> String {
    columns
        .split(',')
        .map(|c| {
            let c = c.trim();
            format!("{alias}.{c} AS {alias}_{c}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn match_from_row(row: &PgRow) -> Result<(HarvestedRecord, ListingPost), StoreError> {
    let h_status: String = row.try_get("h_status")?;
    let p_status: String = row.try_get("p_phone_fetch_status")?;
    let record = HarvestedRecord {
        arka_id: row.try_get("h_arka_id")?,
        external_id: row.try_get("h_external_id")?,
        phone_number: row.try_get("h_phone_number")?,
        owner_name: row.try_get("h_owner_name")?,
        payload: row.try_get("h_payload")?,
        status: h_status.parse().map_err(|err: lpf_core::UnknownVariant| {
            StoreError::Corrupt {
                table: "harvested_records",
                detail: err.to_string(),
            }
        })?,
        transfer_attempt_count: row.try_get("h_transfer_attempt_count")?,
        transfer_locked_until: row.try_get("h_transfer_locked_until")?,
        next_transfer_attempt_at: row.try_get("h_next_transfer_attempt_at")?,
        transfer_last_error: row.try_get("h_transfer_last_error")?,
        fetched_at: row.try_get("h_fetched_at")?,
        transferred_at: row.try_get("h_transferred_at")?,
    };
    let post = ListingPost {
        id: row.try_get("p_id")?,
        external_id: row.try_get("p_external_id")?,
        contact_uuid: row.try_get("p_contact_uuid")?,
        title: row.try_get("p_title")?,
        phone_number: row.try_get("p_phone_number")?,
        owner_name: row.try_get("p_owner_name")?,
        phone_fetch_status: p_status.parse().map_err(|err: lpf_core::UnknownVariant| {
            StoreError::Corrupt {
                table: "listing_posts",
                detail: err.to_string(),
            }
        })?,
        phone_fetch_locked_until: row.try_get("p_phone_fetch_locked_until")?,
        phone_fetch_lease_id: row.try_get("p_phone_fetch_lease_id")?,
        phone_fetch_worker: row.try_get("p_phone_fetch_worker")?,
        phone_fetch_attempt_count: row.try_get("p_phone_fetch_attempt_count")?,
        phone_fetch_last_error: row.try_get("p_phone_fetch_last_error")?,
        business_ref: row.try_get("p_business_ref")?,
        business_type: row.try_get("p_business_type")?,
        raw_payload: row.try_get("p_raw_payload")?,
        created_at: row.try_get("p_created_at")?,
    };
    Ok((record, post))
}

#[async_trait]
impl StoreTx for PgTx {
    async fn lock_cursor(
        &mut self,
        floor: i64,
        now: DateTime<Utc>,
    ) -> Result<FetchCursor, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO fetch_cursor (id, next_fetch_id, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(CURSOR_KEY)
        .bind(floor)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {CURSOR_COLUMNS} FROM fetch_cursor WHERE id = $1 FOR UPDATE"
        ))
        .bind(CURSOR_KEY)
        .fetch_one(&mut *self.tx)
        .await?;
        cursor_from_row(&row)
    }

    async fn save_cursor(&mut self, cursor: &FetchCursor) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE fetch_cursor
               SET next_fetch_id = $2,
                   locked_until = $3,
                   locked_by = $4,
                   backoff_until = $5,
                   last_status = $6,
                   last_error = $7,
                   updated_at = $8
             WHERE id = $1
            "#,
        )
        .bind(&cursor.id)
        .bind(cursor.next_fetch_id)
        .bind(cursor.locked_until)
        .bind(&cursor.locked_by)
        .bind(cursor.backoff_until)
        .bind(&cursor.last_status)
        .bind(&cursor.last_error)
        .bind(cursor.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_harvested(&mut self, record: &HarvestedRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO harvested_records (
                arka_id, external_id, phone_number, owner_name, payload, status,
                transfer_attempt_count, transfer_locked_until, next_transfer_attempt_at,
                transfer_last_error, fetched_at, transferred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (arka_id) DO UPDATE
               SET external_id = EXCLUDED.external_id,
                   phone_number = EXCLUDED.phone_number,
                   owner_name = EXCLUDED.owner_name,
                   payload = EXCLUDED.payload,
                   status = EXCLUDED.status,
                   transfer_attempt_count = EXCLUDED.transfer_attempt_count,
                   transfer_locked_until = EXCLUDED.transfer_locked_until,
                   next_transfer_attempt_at = EXCLUDED.next_transfer_attempt_at,
                   transfer_last_error = EXCLUDED.transfer_last_error,
                   fetched_at = EXCLUDED.fetched_at,
                   transferred_at = EXCLUDED.transferred_at
            "#,
        )
        .bind(record.arka_id)
        .bind(&record.external_id)
        .bind(&record.phone_number)
        .bind(&record.owner_name)
        .bind(&record.payload)
        .bind(record.status.as_str())
        .bind(record.transfer_attempt_count)
        .bind(record.transfer_locked_until)
        .bind(record.next_transfer_attempt_at)
        .bind(&record.transfer_last_error)
        .bind(record.fetched_at)
        .bind(record.transferred_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_next_transferable(
        &mut self,
        filter: &TransferFilter,
    ) -> Result<Option<HarvestedRecord>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
              FROM harvested_records
             WHERE status <> 'TRANSFERRED'
               AND ($2::timestamptz IS NULL OR fetched_at > $2)
               AND (transfer_locked_until IS NULL OR transfer_locked_until <= $1)
               AND (NOT $3 OR next_transfer_attempt_at IS NULL OR next_transfer_attempt_at <= $1)
             ORDER BY fetched_at ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(filter.now)
        .bind(filter.fetched_after)
        .bind(filter.honor_defer)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn save_harvested(&mut self, record: &HarvestedRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE harvested_records
               SET status = $2,
                   transfer_attempt_count = $3,
                   transfer_locked_until = $4,
                   next_transfer_attempt_at = $5,
                   transfer_last_error = $6,
                   transferred_at = $7
             WHERE arka_id = $1
            "#,
        )
        .bind(record.arka_id)
        .bind(record.status.as_str())
        .bind(record.transfer_attempt_count)
        .bind(record.transfer_locked_until)
        .bind(record.next_transfer_attempt_at)
        .bind(&record.transfer_last_error)
        .bind(record.transferred_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_missing_post_matches(
        &mut self,
        filter: &TransferFilter,
        limit: i64,
    ) -> Result<Vec<(HarvestedRecord, ListingPost)>, StoreError> {
        let sql = format!(
            r#"
            SELECT {record_cols}, {post_cols}
              FROM harvested_records h
              JOIN listing_posts p ON p.external_id = h.external_id
             WHERE h.status <> 'TRANSFERRED'
               AND h.phone_number IS NOT NULL
               AND h.phone_number <> $4
               AND ($2::timestamptz IS NULL OR h.fetched_at > $2)
               AND (h.transfer_locked_until IS NULL OR h.transfer_locked_until <= $1)
               AND p.phone_number IS NULL
             ORDER BY h.fetched_at ASC
             LIMIT $3
             FOR UPDATE OF h, p SKIP LOCKED
            "#,
            record_cols = prefixed(RECORD_COLUMNS, "h"),
            post_cols = prefixed(POST_COLUMNS, "p"),
        );
        let rows = sqlx::query(&sql)
            .bind(filter.now)
            .bind(filter.fetched_after)
            .bind(limit)
            .bind(SENTINEL_PHONE)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(match_from_row).collect()
    }

    async fn lock_next_lease_candidate(
        &mut self,
        now: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<Option<ListingPost>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {POST_COLUMNS}
              FROM listing_posts
             WHERE contact_uuid IS NOT NULL
               AND phone_number IS NULL
               AND phone_fetch_attempt_count < $2
               AND phone_fetch_status <> 'DONE'
               AND (phone_fetch_locked_until IS NULL OR phone_fetch_locked_until <= $1)
             ORDER BY created_at DESC
             LIMIT 1
             FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(max_attempts)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(post_from_row).transpose()
    }

    async fn lock_post_by_external_id(
        &mut self,
        external_id: &str,
    ) -> Result<Option<ListingPost>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {POST_COLUMNS} FROM listing_posts WHERE external_id = $1 LIMIT 1 FOR UPDATE"
        ))
        .bind(external_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(post_from_row).transpose()
    }

    async fn lock_post_by_lease(
        &mut self,
        lease_id: Uuid,
    ) -> Result<Option<ListingPost>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {POST_COLUMNS} FROM listing_posts WHERE phone_fetch_lease_id = $1 LIMIT 1 FOR UPDATE"
        ))
        .bind(lease_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(post_from_row).transpose()
    }

    async fn lock_lease_targets(
        &mut self,
        lease_id: Uuid,
        business_ref: Option<&str>,
    ) -> Result<Vec<ListingPost>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {POST_COLUMNS}
              FROM listing_posts
             WHERE phone_fetch_lease_id = $1
                OR ($2::text IS NOT NULL AND business_ref = $2)
             ORDER BY id
               FOR UPDATE
            "#
        ))
        .bind(lease_id)
        .bind(business_ref)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(post_from_row).collect()
    }

    async fn save_post(&mut self, post: &ListingPost) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE listing_posts
               SET phone_number = $2,
                   owner_name = $3,
                   phone_fetch_status = $4,
                   phone_fetch_locked_until = $5,
                   phone_fetch_lease_id = $6,
                   phone_fetch_worker = $7,
                   phone_fetch_attempt_count = $8,
                   phone_fetch_last_error = $9,
                   business_ref = $10,
                   business_type = $11
             WHERE id = $1
            "#,
        )
        .bind(post.id)
        .bind(&post.phone_number)
        .bind(&post.owner_name)
        .bind(post.phone_fetch_status.as_str())
        .bind(post.phone_fetch_locked_until)
        .bind(post.phone_fetch_lease_id)
        .bind(&post.phone_fetch_worker)
        .bind(post.phone_fetch_attempt_count)
        .bind(&post.phone_fetch_last_error)
        .bind(&post.business_ref)
        .bind(&post.business_type)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_business(
        &mut self,
        business_ref: &str,
    ) -> Result<BusinessPhoneCache, StoreError> {
        sqlx::query(
            "INSERT INTO business_phone_cache (business_ref) VALUES ($1) ON CONFLICT (business_ref) DO NOTHING",
        )
        .bind(business_ref)
        .execute(&mut *self.tx)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {CACHE_COLUMNS} FROM business_phone_cache WHERE business_ref = $1 FOR UPDATE"
        ))
        .bind(business_ref)
        .fetch_one(&mut *self.tx)
        .await?;
        cache_from_row(&row)
    }

    async fn lock_next_stale_title(
        &mut self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<BusinessPhoneCache>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {CACHE_COLUMNS}
              FROM business_phone_cache
             WHERE (title IS NULL OR title_fetched_at IS NULL OR title_fetched_at <= $2)
               AND (locked_until IS NULL OR locked_until <= $1)
             ORDER BY title_fetched_at ASC NULLS FIRST, business_ref ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(cache_from_row).transpose()
    }

    async fn save_business(&mut self, entry: &BusinessPhoneCache) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO business_phone_cache (
                business_ref, phone_number, fetched_at, locked_until, title, title_fetched_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (business_ref) DO UPDATE
               SET phone_number = EXCLUDED.phone_number,
                   fetched_at = EXCLUDED.fetched_at,
                   locked_until = EXCLUDED.locked_until,
                   title = EXCLUDED.title,
                   title_fetched_at = EXCLUDED.title_fetched_at
            "#,
        )
        .bind(&entry.business_ref)
        .bind(&entry.phone_number)
        .bind(entry.fetched_at)
        .bind(entry.locked_until)
        .bind(&entry.title)
        .bind(entry.title_fetched_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
