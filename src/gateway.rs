//! Query Gateway
//!
//! Thin execution layer over the one live connection of a shared database
//! session. It executes what it is given, converts every SQL failure into a
//! uniform error, and exposes transaction control and table introspection.
//! It never retries and never interprets error semantics; that is the
//! processor's job.
//!
//! Apart from the login timeout applied when the connection was opened,
//! statements carry no deadline: a hung query blocks its caller.

use sqlx::any::{AnyArguments, AnyQueryResult, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, Connection, Executor, Row};

use crate::dialect::{Dialect, GeneratedKeys};
use crate::error::{Error, Result};

/// A value bound into a parameterized statement
#[derive(Debug, Clone)]
pub enum SqlValue {
    Int(i64),
    Text(String),
    Null,
}

impl SqlValue {
    pub fn int(value: i64) -> Self {
        SqlValue::Int(value)
    }

    pub fn text(value: impl Into<String>) -> Self {
        SqlValue::Text(value.into())
    }
}

/// Execution layer over an exclusively-owned connection
///
/// One gateway per opened shared database; there is no pooling. `&mut self`
/// receivers serialize all use of the connection at compile time.
pub struct QueryGateway {
    connection: AnyConnection,
    dialect: Dialect,
}

impl QueryGateway {
    pub fn new(connection: AnyConnection, dialect: Dialect) -> Self {
        Self {
            connection,
            dialect,
        }
    }

    /// Dialect this gateway's connection speaks
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Execute a statement without bind parameters (DDL, transaction
    /// control). Runs unprepared; some backends refuse to prepare these.
    pub async fn execute(&mut self, sql: &str) -> Result<u64> {
        tracing::debug!(sql = preview(sql), "executing statement");

        let result = self
            .connection
            .execute(sql)
            .await
            .map_err(|e| log_and_convert(sql, e))?;

        Ok(result.rows_affected())
    }

    /// Execute a parameterized statement
    pub async fn execute_with(&mut self, sql: &str, params: &[SqlValue]) -> Result<AnyQueryResult> {
        tracing::debug!(sql = preview(sql), "executing statement");

        bind_params(sql, params)
            .execute(&mut self.connection)
            .await
            .map_err(|e| log_and_convert(sql, e))
    }

    /// Run a parameterized query and fetch all rows
    pub async fn fetch_all_with(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<AnyRow>> {
        tracing::debug!(sql = preview(sql), "executing query");

        bind_params(sql, params)
            .fetch_all(&mut self.connection)
            .await
            .map_err(|e| log_and_convert(sql, e))
    }

    /// Run a parameterized query expected to return at most one row
    pub async fn fetch_optional_with(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<AnyRow>> {
        tracing::debug!(sql = preview(sql), "executing query");

        bind_params(sql, params)
            .fetch_optional(&mut self.connection)
            .await
            .map_err(|e| log_and_convert(sql, e))
    }

    /// Execute an insert and return the generated key of the new row.
    ///
    /// Insert-returning-id syntax differs per backend, so the strategy comes
    /// from the dialect: either the statement result carries the key, or a
    /// `RETURNING` clause is appended and the insert runs as a query.
    pub async fn insert_returning_id(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        key_column: &str,
    ) -> Result<i64> {
        match self.dialect.generated_keys() {
            GeneratedKeys::LastInsertId => {
                let result = self.execute_with(sql, params).await?;
                result.last_insert_id().ok_or_else(|| {
                    Error::QueryExecution(format!("no generated key returned for '{}'", preview(sql)))
                })
            }
            GeneratedKeys::Returning => {
                let sql = format!("{} RETURNING {}", sql, self.dialect.escape(key_column));
                let row = self
                    .fetch_optional_with(&sql, params)
                    .await?
                    .ok_or_else(|| {
                        Error::QueryExecution(format!("no generated key returned for '{}'", preview(&sql)))
                    })?;
                row.try_get::<i64, _>(0).map_err(Error::Database)
            }
        }
    }

    /// Names of all tables in the current database
    pub async fn table_names(&mut self) -> Result<Vec<String>> {
        let sql = self.dialect.table_names_sql();
        let rows = self
            .connection
            .fetch_all(sql)
            .await
            .map_err(|e| log_and_convert(sql, e))?;

        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>(0).ok())
            .collect())
    }

    /// Start a transaction; statements after this are held back until
    /// [`commit`](Self::commit) or undone by [`rollback`](Self::rollback)
    pub async fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN").await.map(|_| ())
    }

    /// Apply all statements of the current transaction
    pub async fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT").await.map(|_| ())
    }

    /// Undo all statements of the current transaction
    pub async fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK").await.map(|_| ())
    }

    /// Cheap liveness probe of the connection
    pub async fn ping(&mut self) -> Result<()> {
        self.connection.ping().await.map_err(Error::Database)
    }

    /// Close the connection cleanly
    pub async fn close(self) -> Result<()> {
        self.connection.close().await.map_err(Error::Database)
    }
}

/// Build a query with all parameters bound in order
fn bind_params<'q>(sql: &'q str, params: &'q [SqlValue]) -> Query<'q, Any, AnyArguments<'q>> {
    let mut query = sqlx::query(sql);
    for value in params {
        query = match value {
            SqlValue::Int(value) => query.bind(*value),
            SqlValue::Text(value) => query.bind(value.as_str()),
            SqlValue::Null => query.bind(Option::<String>::None),
        };
    }
    query
}

fn log_and_convert(sql: &str, err: sqlx::Error) -> Error {
    tracing::error!(sql = preview(sql), error = %err, "SQL execution failed");
    Error::QueryExecution(format!("'{}' failed: {}", preview(sql), err))
}

fn preview(sql: &str) -> &str {
    &sql[..sql.len().min(120)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connector;

    async fn sqlite_gateway() -> QueryGateway {
        let config = ConnectionConfig::new(Dialect::Sqlite, ":memory:");
        let connection = connector::connect(&config).await.unwrap();
        QueryGateway::new(connection, Dialect::Sqlite)
    }

    #[tokio::test]
    async fn test_execute_and_fetch() {
        let mut gateway = sqlite_gateway().await;
        gateway
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT)")
            .await
            .unwrap();

        let id = gateway
            .insert_returning_id(
                "INSERT INTO t (name) VALUES (?)",
                &[SqlValue::text("first")],
                "id",
            )
            .await
            .unwrap();
        assert_eq!(id, 1);

        let rows = gateway
            .fetch_all_with("SELECT name FROM t WHERE id = ?", &[SqlValue::int(id)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].try_get::<String, _>(0).unwrap(), "first");
    }

    #[tokio::test]
    async fn test_table_names() {
        let mut gateway = sqlite_gateway().await;
        gateway.execute("CREATE TABLE alpha (x TEXT)").await.unwrap();
        gateway.execute("CREATE TABLE beta (x TEXT)").await.unwrap();

        let tables = gateway.table_names().await.unwrap();
        assert!(tables.contains(&"alpha".to_string()));
        assert!(tables.contains(&"beta".to_string()));
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() {
        let mut gateway = sqlite_gateway().await;
        gateway.execute("CREATE TABLE t (x TEXT)").await.unwrap();

        gateway.begin().await.unwrap();
        gateway
            .execute_with("INSERT INTO t (x) VALUES (?)", &[SqlValue::text("gone")])
            .await
            .unwrap();
        gateway.rollback().await.unwrap();

        let rows = gateway.fetch_all_with("SELECT x FROM t", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_sql_errors_are_uniform() {
        let mut gateway = sqlite_gateway().await;
        let err = gateway.execute("SELECT * FROM missing").await.unwrap_err();
        assert!(matches!(err, Error::QueryExecution(_)));
    }
}
