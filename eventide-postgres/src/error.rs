use uuid::Uuid;

/// Error type for `PostgreSQL` backend operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Query execution or transaction failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored version was negative.
    #[error("invalid version value from database: {0}")]
    InvalidVersion(i64),
    /// A version does not fit in a `BIGINT` column.
    #[error("version {0} exceeds the storable range")]
    VersionOverflow(u64),
    /// The aggregate record vanished inside a transaction.
    #[error("no aggregate record for {0}")]
    MissingRecord(Uuid),
    /// Neither `EVENTIDE_DATABASE_URL` nor `DATABASE_URL` is set.
    #[error("database url not configured (set EVENTIDE_DATABASE_URL or DATABASE_URL)")]
    MissingDatabaseUrl,
}

pub(crate) fn version_from_db(value: i64) -> Result<u64, Error> {
    u64::try_from(value).map_err(|_| Error::InvalidVersion(value))
}

pub(crate) fn version_to_db(value: u64) -> Result<i64, Error> {
    i64::try_from(value).map_err(|_| Error::VersionOverflow(value))
}
