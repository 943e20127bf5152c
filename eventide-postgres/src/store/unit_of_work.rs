use eventide_core::{event::EncodedEvent, store::AggregateRecord};
use sqlx::{
    Postgres, QueryBuilder, Row, Transaction,
    types::chrono::{DateTime, Utc},
};
use uuid::Uuid;

use crate::{
    Error,
    error::{version_from_db, version_to_db},
};

/// An open `PostgreSQL` transaction.
///
/// Dropping it without committing rolls the transaction back.
pub struct UnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl UnitOfWork {
    pub(super) const fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self { tx }
    }
}

impl eventide_core::store::UnitOfWork for UnitOfWork {
    type Error = Error;

    async fn lock_record(&mut self, id: Uuid) -> Result<Option<AggregateRecord>, Error> {
        let row = sqlx::query(
            r"
            SELECT type_name, version
            FROM eventide_aggregates
            WHERE id = $1
            FOR UPDATE
            ",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(|row| -> Result<AggregateRecord, Error> {
            Ok(AggregateRecord {
                id,
                type_name: row.try_get("type_name")?,
                version: version_from_db(row.try_get("version")?)?,
            })
        })
        .transpose()
    }

    #[tracing::instrument(skip(self, record), fields(aggregate_id = %record.id, type_name = %record.type_name))]
    async fn create_record(&mut self, record: &AggregateRecord) -> Result<AggregateRecord, Error> {
        let inserted = sqlx::query(
            r"
            INSERT INTO eventide_aggregates (id, type_name, version)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(record.id)
        .bind(&record.type_name)
        .bind(version_to_db(record.version)?)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tracing::debug!("aggregate record created concurrently; re-reading");
        }

        self.lock_record(record.id)
            .await?
            .ok_or(Error::MissingRecord(record.id))
    }

    #[tracing::instrument(skip(self, events), fields(aggregate_id = %id, events_len = events.len()))]
    async fn append(&mut self, id: Uuid, events: &[EncodedEvent]) -> Result<(), Error> {
        if events.is_empty() {
            return Ok(());
        }

        // The record is locked, so no other batch for this id can slip in
        // between reading the newest stamp and inserting.
        let committed_at: DateTime<Utc> = sqlx::query_scalar(
            r"
            SELECT GREATEST(clock_timestamp(), max(committed_at))
            FROM eventide_events
            WHERE aggregate_id = $1
            ",
        )
        .bind(id)
        .fetch_one(&mut *self.tx)
        .await?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO eventide_events (aggregate_id, type_name, payload, committed_at) ",
        );
        qb.push_values(events, |mut b, event| {
            b.push_bind(id);
            b.push_bind(&event.kind);
            b.push_bind(&event.payload);
            b.push_bind(committed_at);
        });
        qb.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn refresh_version(&mut self, id: Uuid) -> Result<u64, Error> {
        let version: Option<i64> = sqlx::query_scalar(
            r"
            UPDATE eventide_aggregates
            SET version = (SELECT COUNT(*) FROM eventide_events WHERE aggregate_id = $1)
            WHERE id = $1
            RETURNING version
            ",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        version
            .ok_or(Error::MissingRecord(id))
            .and_then(version_from_db)
    }

    async fn commit(self) -> Result<(), Error> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), Error> {
        self.tx.rollback().await?;
        Ok(())
    }
}
