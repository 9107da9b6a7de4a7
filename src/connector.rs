//! Connection Factory
//!
//! Opens a live connection to one of the supported backends and maps every
//! way that can fail into a uniform error. Retry policy belongs to the
//! caller; this module tries exactly once, bounded by a login timeout so a
//! dead host cannot hang the caller indefinitely.

use std::sync::Once;
use std::time::Duration;

use sqlx::any::install_default_drivers;
use sqlx::{AnyConnection, Connection, Executor};
use tokio::time::timeout;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// Deadline for the initial connection attempt
const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);

static DRIVERS: Once = Once::new();

/// Open a connection to the shared database described by `config`.
///
/// Driver registration happens once per process. The returned connection has
/// already run the dialect's session setup statements and is ready for use.
pub async fn connect(config: &ConnectionConfig) -> Result<AnyConnection> {
    DRIVERS.call_once(install_default_drivers);

    let address = config.address();
    let url = config.url();

    tracing::debug!(dialect = %config.dialect, %address, "connecting to shared database");

    let mut connection = match timeout(LOGIN_TIMEOUT, AnyConnection::connect(&url)).await {
        Ok(Ok(connection)) => connection,
        Ok(Err(err)) => {
            // Error codes differ per backend and some report 0 for every
            // failure; carry them verbatim, callers treat them as opaque.
            let code = match &err {
                sqlx::Error::Database(db_err) => db_err.code().map(|code| code.to_string()),
                _ => None,
            };
            tracing::error!(%address, error = %err, "could not connect to shared database");
            return Err(Error::ConnectionFailed {
                address,
                code,
                reason: err.to_string(),
            });
        }
        Err(_) => {
            tracing::error!(%address, timeout = ?LOGIN_TIMEOUT, "connection attempt timed out");
            return Err(Error::ConnectionTimeout(address));
        }
    };

    for statement in config.dialect.session_setup_sql() {
        connection.execute(*statement).await?;
    }

    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;

    #[tokio::test]
    async fn test_connect_sqlite_in_memory() {
        let config = ConnectionConfig::new(Dialect::Sqlite, ":memory:");
        let mut connection = connect(&config).await.unwrap();
        connection.ping().await.unwrap();
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_uniform() {
        // nothing listens on this port; must fail within the login timeout
        let mut config = ConnectionConfig::new(Dialect::Postgres, "refs");
        config.host = "127.0.0.1".to_string();
        config.port = Some(1);

        let err = connect(&config).await.unwrap_err();
        assert!(err.is_connection_failure(), "unexpected error: {err}");
    }
}
