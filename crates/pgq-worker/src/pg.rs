//! Shared PostgreSQL plumbing: pool construction and error classification

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, instrument};

use crate::config::WorkerConfig;

/// SQLSTATE raised when a relation (e.g. a pgmq queue table) does not exist
const UNDEFINED_TABLE: &str = "42P01";

const UNIQUE_VIOLATION: &str = "23505";

/// Open a connection pool sized for a worker
///
/// The pool is sized by `max_pg_connections`, independently of
/// `max_concurrent`.
#[instrument(skip(database_url), fields(max_connections = config.max_pg_connections))]
pub async fn connect(database_url: &str, config: &WorkerConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    debug!("connected to PostgreSQL");
    Ok(pool)
}

/// Whether an error is a connection-level hiccup worth retrying later
pub(crate) fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| {
            // 08: connection exception, 40: transaction rollback, 53: insufficient
            // resources, 57P: operator intervention (admin shutdown etc.)
            code.starts_with("08")
                || code.starts_with("40")
                || code.starts_with("53")
                || code.starts_with("57P")
        }),
        _ => false,
    }
}

/// Whether an error says the target relation is missing
pub(crate) fn is_undefined_table(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNDEFINED_TABLE))
}

/// Whether an error is a primary key or unique constraint conflict
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_transient() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(is_transient(&sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))));
    }

    #[test]
    fn test_decode_errors_are_fatal() {
        assert!(!is_transient(&sqlx::Error::RowNotFound));
        assert!(!is_transient(&sqlx::Error::ColumnNotFound("vt".into())));
        assert!(!is_undefined_table(&sqlx::Error::RowNotFound));
    }
}
