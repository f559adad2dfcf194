//! Postgres-backed store implementations.
//!
//! Run rows keep the serialized entity in a JSONB `data` column with the
//! fields the store filters on (status, payment id, flow path) denormalized
//! alongside it. Single-row INSERT/UPDATE gives the atomicity the engine's
//! read-modify-write cycle relies on; no cross-row transactions are needed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::instrument;

use flowbridge_core::{FlowRun, RunId, StoredSession};

use crate::run_store::{RunStore, StoreError};
use crate::session_store::SessionStore;

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> StoreError {
    StoreError::Storage(format!("{}: {}", operation, e))
}

fn decode_run(row: &sqlx::postgres::PgRow) -> Result<FlowRun, StoreError> {
    let data: serde_json::Value = row
        .try_get("data")
        .map_err(|e| StoreError::Storage(format!("missing data column: {}", e)))?;
    serde_json::from_value(data)
        .map_err(|e| StoreError::Storage(format!("failed to decode run row: {}", e)))
}

/// Postgres-backed run store.
#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: Arc<PgPool>,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the backing tables if they do not exist yet.
    pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flow_runs (
                id UUID PRIMARY KEY,
                flow_path TEXT NOT NULL,
                status TEXT NOT NULL,
                payment_id TEXT,
                upstream_run_id TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                timeout_at TIMESTAMPTZ,
                data JSONB NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate flow_runs", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS flow_runs_status_idx ON flow_runs (status)",
        )
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate flow_runs index", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS auth_sessions (
                service TEXT PRIMARY KEY,
                data JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate auth_sessions", e))?;

        Ok(())
    }

    fn encode(run: &FlowRun) -> Result<serde_json::Value, StoreError> {
        serde_json::to_value(run)
            .map_err(|e| StoreError::Storage(format!("failed to encode run: {}", e)))
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    #[instrument(skip(self, run), fields(run_id = %run.id), err)]
    async fn create(&self, run: &FlowRun) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO flow_runs
                (id, flow_path, status, payment_id, upstream_run_id,
                 created_at, updated_at, timeout_at, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(&run.flow_path)
        .bind(run.status.to_string())
        .bind(&run.payment_id)
        .bind(&run.upstream_run_id)
        .bind(run.created_at)
        .bind(run.updated_at)
        .bind(run.timeout_at)
        .bind(Self::encode(run)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create run", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(run.id));
        }
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<Option<FlowRun>, StoreError> {
        let row = sqlx::query("SELECT data FROM flow_runs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get run", e))?;

        row.as_ref().map(decode_run).transpose()
    }

    async fn get_by_payment_id(&self, payment_id: &str) -> Result<Option<FlowRun>, StoreError> {
        let row = sqlx::query("SELECT data FROM flow_runs WHERE payment_id = $1")
            .bind(payment_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get run by payment id", e))?;

        row.as_ref().map(decode_run).transpose()
    }

    #[instrument(skip(self, run), fields(run_id = %run.id, status = %run.status), err)]
    async fn update(&self, run: &FlowRun) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flow_runs
            SET status = $2,
                payment_id = $3,
                upstream_run_id = $4,
                updated_at = $5,
                timeout_at = $6,
                data = $7
            WHERE id = $1
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(run.status.to_string())
        .bind(&run.payment_id)
        .bind(&run.upstream_run_id)
        .bind(run.updated_at)
        .bind(run.timeout_at)
        .bind(Self::encode(run)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update run", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(run.id));
        }
        Ok(())
    }

    async fn list_pollable(&self) -> Result<Vec<FlowRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM flow_runs
            WHERE status IN ('pending_payment', 'starting', 'running')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list pollable runs", e))?;

        rows.iter().map(decode_run).collect()
    }

    async fn list_pending_payment(&self) -> Result<Vec<FlowRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM flow_runs
            WHERE status = 'pending_payment'
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list pending-payment runs", e))?;

        rows.iter().map(decode_run).collect()
    }

    async fn list_by_flow(&self, flow_path: &str, limit: usize) -> Result<Vec<FlowRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM flow_runs
            WHERE flow_path = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(flow_path)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list runs by flow", e))?;

        rows.iter().map(decode_run).collect()
    }
}

/// Postgres-backed session store.
#[derive(Debug, Clone)]
pub struct PgSessionStore {
    pool: Arc<PgPool>,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn load(&self, service: &str) -> Result<Option<StoredSession>, StoreError> {
        let row = sqlx::query("SELECT data FROM auth_sessions WHERE service = $1")
            .bind(service)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load session", e))?;

        row.map(|row| {
            let data: serde_json::Value = row
                .try_get("data")
                .map_err(|e| StoreError::Storage(format!("missing data column: {}", e)))?;
            serde_json::from_value(data)
                .map_err(|e| StoreError::Storage(format!("failed to decode session: {}", e)))
        })
        .transpose()
    }

    async fn save(&self, service: &str, session: &StoredSession) -> Result<(), StoreError> {
        let data = serde_json::to_value(session)
            .map_err(|e| StoreError::Storage(format!("failed to encode session: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO auth_sessions (service, data, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (service) DO UPDATE
            SET data = EXCLUDED.data, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(service)
        .bind(data)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save session", e))?;

        Ok(())
    }

    async fn clear(&self, service: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM auth_sessions WHERE service = $1")
            .bind(service)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("clear session", e))?;
        Ok(())
    }
}
