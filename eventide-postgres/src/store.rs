mod history;
mod unit_of_work;

use std::collections::HashSet;

use eventide_core::store::RecordStream;
use sqlx::PgPool;
use uuid::Uuid;

pub use self::unit_of_work::UnitOfWork;
use crate::{Error, PostgresConfig, error::version_from_db};

/// Schema applied by [`Backend::migrate`].
///
/// Every statement is idempotent, so the schema can be applied on each
/// startup.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS eventide_aggregates (
    id        UUID PRIMARY KEY,
    type_name TEXT NOT NULL,
    version   BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS eventide_events (
    sequence     BIGSERIAL PRIMARY KEY,
    aggregate_id UUID NOT NULL,
    type_name    TEXT NOT NULL,
    payload      BYTEA NOT NULL,
    committed_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
);

CREATE INDEX IF NOT EXISTS eventide_events_by_aggregate
    ON eventide_events (aggregate_id, committed_at, sequence);

CREATE INDEX IF NOT EXISTS eventide_aggregates_by_type
    ON eventide_aggregates (type_name);
";

/// A `PostgreSQL`-backed [`eventide_core::store::Backend`].
///
/// Saves run in a single transaction that locks the aggregate row with
/// `SELECT ... FOR UPDATE`, so concurrent writers to one aggregate are
/// serialized and the version check cannot race.
#[derive(Clone, Debug)]
pub struct Backend {
    pool: PgPool,
}

impl Backend {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the database cannot be reached.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, Error> {
        Ok(Self::new(config.connect().await?))
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply [`SCHEMA`] (idempotent).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if any statement fails.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), Error> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        tracing::debug!("schema applied");
        Ok(())
    }
}

impl eventide_core::store::Backend for Backend {
    type Error = Error;
    type UnitOfWork = UnitOfWork;

    async fn begin(&self) -> Result<UnitOfWork, Error> {
        Ok(UnitOfWork::new(self.pool.begin().await?))
    }

    fn read_history(&self, id: Uuid) -> RecordStream<'_, Error> {
        history::read(&self.pool, id)
    }

    #[tracing::instrument(skip(self))]
    async fn ids_for_type(&self, type_name: &str) -> Result<HashSet<Uuid>, Error> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar(r"SELECT id FROM eventide_aggregates WHERE type_name = $1")
                .bind(type_name)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }

    async fn version(&self, id: Uuid) -> Result<Option<u64>, Error> {
        let version: Option<i64> =
            sqlx::query_scalar(r"SELECT version FROM eventide_aggregates WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        version.map(version_from_db).transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn remove_unused(&self) -> Result<u64, Error> {
        let result = sqlx::query(
            r"
            DELETE FROM eventide_aggregates a
            WHERE NOT EXISTS (
                SELECT 1 FROM eventide_events e WHERE e.aggregate_id = a.id
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
