use eventide_core::store::{RecordStream, StoredRecord};
use sqlx::{PgPool, Row, postgres::PgRow};
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::Error;

fn decode_row(row: &PgRow) -> Result<StoredRecord, Error> {
    Ok(StoredRecord {
        sequence: row.try_get("sequence")?,
        aggregate_id: row.try_get("aggregate_id")?,
        kind: row.try_get("type_name")?,
        payload: row.try_get("payload")?,
        committed_at: row.try_get("committed_at")?,
    })
}

/// Stream the events of `id` through a server-side cursor.
///
/// The connection is held until the stream is exhausted or dropped.
pub(super) fn read(pool: &PgPool, id: Uuid) -> RecordStream<'_, Error> {
    Box::pin(async_stream::stream! {
        let mut rows = sqlx::query(
            r"
            SELECT sequence, aggregate_id, type_name, payload, committed_at
            FROM eventide_events
            WHERE aggregate_id = $1
            ORDER BY committed_at ASC, sequence ASC
            ",
        )
        .bind(id)
        .fetch(pool);

        while let Some(row) = rows.next().await {
            match row.map_err(Error::from).and_then(|row| decode_row(&row)) {
                Ok(record) => yield Ok(record),
                Err(error) => {
                    yield Err(error);
                    return;
                }
            }
        }
    })
}
