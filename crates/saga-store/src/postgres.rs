use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ActivationId, ChatId, ProfileId, SagaId};
use domain::{Amount, Saga, SagaFlag, SagaStatus, Version};
use sqlx::{
    PgPool, Row,
    postgres::{PgPoolOptions, PgRow},
};
use uuid::Uuid;

use crate::{
    Result, SagaStoreError,
    store::{SagaStore, TransitionOptions, ensure_refunded, rejection, validate_transition},
};

const SAGA_COLUMNS: &str = "id, activation_id, profile_id, chat_id, amount, status, version, \
     run_at, credited_at, flag, last_error, created_at, updated_at";

/// PostgreSQL-backed saga store.
///
/// Conditional transitions are single `UPDATE ... WHERE version = $n AND
/// status = ANY($m)` statements, so they stay correct across processes.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to `database_url` with a pool of at most `max_connections`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_saga(row: PgRow) -> Result<Saga> {
        let status: String = row.try_get("status")?;
        let flag: Option<String> = row.try_get("flag")?;

        Ok(Saga {
            id: SagaId::from_uuid(row.try_get::<Uuid, _>("id")?),
            activation_id: ActivationId::new(row.try_get("activation_id")?),
            profile_id: ProfileId::new(row.try_get("profile_id")?),
            chat_id: ChatId::new(row.try_get("chat_id")?),
            amount: Amount::new(row.try_get("amount")?)?,
            status: status.parse()?,
            version: Version::new(row.try_get("version")?),
            run_at: row.try_get("run_at")?,
            credited_at: row.try_get("credited_at")?,
            flag: flag.map(|f| f.parse()).transpose()?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn fetch(&self, activation_id: ActivationId) -> Result<Option<Saga>> {
        let row: Option<PgRow> = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM sagas WHERE activation_id = $1"
        ))
        .bind(activation_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn fetch_required(&self, activation_id: ActivationId) -> Result<Saga> {
        self.fetch(activation_id)
            .await?
            .ok_or(SagaStoreError::NotFound(activation_id))
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn insert(&self, saga: Saga) -> Result<Saga> {
        let activation_id = saga.activation_id;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sagas ({SAGA_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {SAGA_COLUMNS}
            "#
        ))
        .bind(saga.id.as_uuid())
        .bind(saga.activation_id.as_i64())
        .bind(saga.profile_id.as_i64())
        .bind(saga.chat_id.as_i64())
        .bind(saga.amount.as_f64())
        .bind(saga.status.as_str())
        .bind(saga.version.as_i64())
        .bind(saga.run_at)
        .bind(saga.credited_at)
        .bind(saga.flag.map(|f| f.as_str()))
        .bind(saga.last_error.as_deref())
        .bind(saga.created_at)
        .bind(saga.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("unique_activation")
            {
                return SagaStoreError::AlreadyExists(activation_id);
            }
            SagaStoreError::Database(e)
        })?;

        Self::row_to_saga(row)
    }

    async fn get(&self, activation_id: ActivationId) -> Result<Option<Saga>> {
        self.fetch(activation_id).await
    }

    async fn transition(
        &self,
        activation_id: ActivationId,
        to: SagaStatus,
        options: TransitionOptions,
    ) -> Result<Saga> {
        validate_transition(to, &options)?;

        let allowed: Vec<String> = options
            .allowed_from
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        // No edge leads back into Scheduled, so every transition consumes run_at.
        let row: Option<PgRow> = sqlx::query(&format!(
            r#"
            UPDATE sagas
            SET status = $1, version = version + 1, run_at = NULL, updated_at = $2
            WHERE activation_id = $3 AND version = $4 AND status = ANY($5)
            RETURNING {SAGA_COLUMNS}
            "#
        ))
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(activation_id.as_i64())
        .bind(options.expected_version.as_i64())
        .bind(allowed)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_saga(row),
            None => {
                let current = self.fetch_required(activation_id).await?;
                metrics::counter!("saga_store_conflicts_total").increment(1);
                Err(rejection(&current, to, &options))
            }
        }
    }

    async fn mark_credited(&self, activation_id: ActivationId, at: DateTime<Utc>) -> Result<Saga> {
        let row: Option<PgRow> = sqlx::query(&format!(
            r#"
            UPDATE sagas
            SET credited_at = $1, version = version + 1, updated_at = $2
            WHERE activation_id = $3 AND status = 'Refunded' AND credited_at IS NULL
            RETURNING {SAGA_COLUMNS}
            "#
        ))
        .bind(at)
        .bind(Utc::now())
        .bind(activation_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_saga(row),
            None => {
                let current = self.fetch_required(activation_id).await?;
                ensure_refunded(&current)?;
                Ok(current)
            }
        }
    }

    async fn flag(
        &self,
        activation_id: ActivationId,
        flag: SagaFlag,
        reason: &str,
    ) -> Result<Saga> {
        let row: Option<PgRow> = sqlx::query(&format!(
            r#"
            UPDATE sagas
            SET flag = $1, last_error = $2, updated_at = $3
            WHERE activation_id = $4
            RETURNING {SAGA_COLUMNS}
            "#
        ))
        .bind(flag.as_str())
        .bind(reason)
        .bind(Utc::now())
        .bind(activation_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga)
            .transpose()?
            .ok_or(SagaStoreError::NotFound(activation_id))
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Saga>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SAGA_COLUMNS}
            FROM sagas
            WHERE status = 'Scheduled' AND flag IS NULL AND run_at <= $1
            ORDER BY run_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }

    async fn list_stalled(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Saga>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SAGA_COLUMNS}
            FROM sagas
            WHERE flag IS NULL
              AND updated_at <= $1
              AND (status IN ('Checking', 'Expired', 'Cancelling')
                   OR (status = 'Refunded' AND credited_at IS NULL))
            ORDER BY updated_at ASC
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }

    async fn list_flagged(&self, flag: SagaFlag, limit: usize) -> Result<Vec<Saga>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SAGA_COLUMNS}
            FROM sagas
            WHERE flag = $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#
        ))
        .bind(flag.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }
}
