//! Postgres-backed ledger store
//!
//! Postgres rather than SQLite because the transactional writer depends on
//! `SELECT ... FOR UPDATE` row locks. Byte counters live in NUMERIC columns
//! and cross the driver boundary as text, so cumulative volumes never hit an
//! integer ceiling.

use crate::error::{MeterError, Result};
use crate::ledger::store::{LedgerStore, LedgerTx};
use crate::ledger::types::{PurchaseStatus, UsageRecord};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

const SELECT_COLUMNS: &str = r#"
    id, package_id, order_code, user_id, purchase_status,
    purchase_start_time, purchase_end_time, next_reset_date,
    data_allowance::text AS data_allowance,
    consumed_data_transfer::text AS consumed_data_transfer,
    consumed_data_download::text AS consumed_data_download,
    consumed_data_upload::text AS consumed_data_upload,
    speed_limit, device_num, device_limit, deleted
"#;

/// Ledger store on a Postgres connection pool.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_record (
                id BIGSERIAL PRIMARY KEY,
                package_id BIGINT NOT NULL,
                order_code VARCHAR(50) NOT NULL,
                user_id TEXT NOT NULL,
                purchase_status SMALLINT NOT NULL DEFAULT 0,
                purchase_start_time TIMESTAMPTZ NOT NULL,
                purchase_end_time TIMESTAMPTZ NOT NULL,
                next_reset_date TIMESTAMPTZ,
                data_allowance NUMERIC NOT NULL,
                consumed_data_transfer NUMERIC NOT NULL DEFAULT 0,
                consumed_data_download NUMERIC NOT NULL DEFAULT 0,
                consumed_data_upload NUMERIC NOT NULL DEFAULT 0,
                speed_limit BIGINT,
                device_num INTEGER,
                device_limit INTEGER,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                deleted BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_usage_record_user_status
            ON usage_record (user_id, purchase_status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                status SMALLINT NOT NULL DEFAULT 1,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS node_usage (
                service_tag TEXT PRIMARY KEY,
                total_bytes NUMERIC NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

pub struct PgLedgerTx {
    tx: sqlx::Transaction<'static, sqlx::Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn select_active_for_update(&mut self, user_ids: &[String]) -> Result<Vec<UsageRecord>> {
        let query = format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM usage_record
            WHERE user_id = ANY($1)
              AND purchase_status = $2
              AND deleted = FALSE
            ORDER BY user_id, id
            FOR UPDATE
            "#
        );

        let rows = sqlx::query(&query)
            .bind(user_ids)
            .bind(PurchaseStatus::Active.as_i16())
            .fetch_all(&mut *self.tx)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn save_batch(&mut self, rows: &[UsageRecord]) -> Result<()> {
        for row in rows {
            sqlx::query(
                r#"
                UPDATE usage_record
                SET consumed_data_transfer = $1::numeric,
                    consumed_data_download = $2::numeric,
                    consumed_data_upload = $3::numeric,
                    purchase_status = $4,
                    updated_at = NOW()
                WHERE id = $5
                "#,
            )
            .bind(row.consumed_data_transfer.to_string())
            .bind(row.consumed_data_download.to_string())
            .bind(row.consumed_data_upload.to_string())
            .bind(row.purchase_status.as_i16())
            .bind(row.id)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    type Tx = PgLedgerTx;

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(PgLedgerTx {
            tx: self.pool.begin().await?,
        })
    }

    async fn authenticate_user(&self, user_id: &str, credential: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS one FROM users
            WHERE id = $1 AND password_hash = $2 AND status = 1
            "#,
        )
        .bind(user_id)
        .bind(credential)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn active_subscriptions(&self, user_id: &str) -> Result<Vec<UsageRecord>> {
        let query = format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM usage_record
            WHERE user_id = $1
              AND purchase_status = $2
              AND deleted = FALSE
            ORDER BY speed_limit ASC NULLS LAST
            "#
        );

        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(PurchaseStatus::Active.as_i16())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn add_node_usage(&self, service_tag: &str, bytes: u128) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO node_usage (service_tag, total_bytes)
            VALUES ($1, $2::numeric)
            ON CONFLICT (service_tag) DO UPDATE
            SET total_bytes = node_usage.total_bytes + EXCLUDED.total_bytes,
                updated_at = NOW()
            "#,
        )
        .bind(service_tag)
        .bind(bytes.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<UsageRecord> {
    let status: i16 = row.try_get("purchase_status")?;
    let purchase_status = PurchaseStatus::from_i16(status)
        .ok_or_else(|| MeterError::Storage(format!("unknown purchase_status {status}")))?;

    Ok(UsageRecord {
        id: row.try_get("id")?,
        package_id: row.try_get("package_id")?,
        order_code: row.try_get("order_code")?,
        user_id: row.try_get("user_id")?,
        purchase_status,
        purchase_start_time: row.try_get("purchase_start_time")?,
        purchase_end_time: row.try_get("purchase_end_time")?,
        next_reset_date: row.try_get("next_reset_date")?,
        data_allowance: parse_bytes(row.try_get("data_allowance")?)?,
        consumed_data_transfer: parse_bytes(row.try_get("consumed_data_transfer")?)?,
        consumed_data_download: parse_bytes(row.try_get("consumed_data_download")?)?,
        consumed_data_upload: parse_bytes(row.try_get("consumed_data_upload")?)?,
        speed_limit: row
            .try_get::<Option<i64>, _>("speed_limit")?
            .map(|v| v.max(0) as u64),
        device_num: row.try_get("device_num")?,
        device_limit: row.try_get("device_limit")?,
        deleted: row.try_get("deleted")?,
    })
}

fn parse_bytes(value: String) -> Result<u128> {
    value
        .parse::<u128>()
        .map_err(|_| MeterError::BadCounter(value))
}
