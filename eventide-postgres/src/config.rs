use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::Error;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for [`Backend`](crate::Backend).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

const fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

const fn default_acquire_timeout() -> Duration {
    DEFAULT_ACQUIRE_TIMEOUT
}

impl PostgresConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Read the url from `EVENTIDE_DATABASE_URL`, falling back to
    /// `DATABASE_URL`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingDatabaseUrl`] if neither is set.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        lookup("EVENTIDE_DATABASE_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .map(Self::new)
            .ok_or(Error::MissingDatabaseUrl)
    }

    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
    }

    /// Open a connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the first connection cannot be made.
    #[tracing::instrument(skip(self), fields(max_connections = self.max_connections))]
    pub async fn connect(&self) -> Result<PgPool, Error> {
        Ok(self.pool_options().connect(&self.url).await?)
    }

    /// Build a pool that connects on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the url cannot be parsed.
    pub fn connect_lazy(&self) -> Result<PgPool, Error> {
        Ok(self.pool_options().connect_lazy(&self.url)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_eventide_url() {
        let config = PostgresConfig::from_lookup(|name| match name {
            "EVENTIDE_DATABASE_URL" => Some("postgres://a/eventide".to_owned()),
            "DATABASE_URL" => Some("postgres://b/other".to_owned()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.url, "postgres://a/eventide");
    }

    #[test]
    fn falls_back_to_database_url() {
        let config = PostgresConfig::from_lookup(|name| {
            (name == "DATABASE_URL").then(|| "postgres://b/other".to_owned())
        })
        .unwrap();
        assert_eq!(config.url, "postgres://b/other");
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn missing_url_is_an_error() {
        let result = PostgresConfig::from_lookup(|_| None);
        assert!(matches!(result, Err(Error::MissingDatabaseUrl)));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: PostgresConfig = serde_json::from_str(
            r#"{"url":"postgres://localhost/eventide","acquire_timeout":"5s"}"#,
        )
        .unwrap();

        assert_eq!(
            config,
            PostgresConfig::new("postgres://localhost/eventide")
                .with_acquire_timeout(Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn lazy_pool_rejects_malformed_url() {
        assert!(PostgresConfig::new("not a url").connect_lazy().is_err());
        assert!(
            PostgresConfig::new("postgres://localhost/eventide")
                .with_max_connections(2)
                .connect_lazy()
                .is_ok()
        );
    }
}
