// ABOUTME: Database Access capability consumed by the synchronization engine
// ABOUTME: Drivers implement DatabaseAccess; the engine never talks to a driver directly

use async_trait::async_trait;
use std::time::Duration;

use crate::error::AccessError;
use crate::schema::TableSchema;
use crate::value::{Record, Value};

pub type AccessResult<T> = std::result::Result<T, AccessError>;

/// A SQL statement with its bound parameters.
///
/// Row data only ever travels in `params`; `sql` contains quoted identifiers
/// and numbered placeholders (`$1`, `$2`, ...), never values.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Collects bound parameters and hands out their placeholders.
#[derive(Debug, Default)]
pub struct Params {
    values: Vec<Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a value and return its placeholder.
    pub fn bind(&mut self, value: Value) -> String {
        self.values.push(value);
        format!("${}", self.values.len())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_statement(self, sql: String) -> Statement {
        Statement::new(sql, self.values)
    }
}

/// Everything the engine needs from a database.
///
/// Implementations own connection pooling, credentials and driver details.
/// Table names passed in are unqualified; the implementation decides which
/// schema they resolve in.
#[async_trait]
pub trait DatabaseAccess: Send + Sync {
    /// Human-readable name used in logs and reports (e.g. "staging").
    fn name(&self) -> &str;

    /// Check that the database is reachable.
    async fn ping(&self) -> AccessResult<()>;

    /// All base tables, sorted by name.
    async fn list_tables(&self) -> AccessResult<Vec<String>>;

    async fn table_exists(&self, table: &str) -> AccessResult<bool>;

    /// Columns in ordinal order plus the primary key columns.
    async fn describe_table(&self, table: &str) -> AccessResult<TableSchema>;

    async fn count(&self, table: &str) -> AccessResult<i64>;

    /// Read `limit` rows starting at `offset`, ordered by `order_by`.
    async fn fetch_page(
        &self,
        table: &str,
        columns: &[String],
        order_by: &str,
        offset: u64,
        limit: u64,
    ) -> AccessResult<Vec<Record>>;

    /// Read `limit` primary key values starting at `offset`, in ascending order.
    async fn fetch_primary_keys(
        &self,
        table: &str,
        primary_key: &str,
        offset: u64,
        limit: u64,
    ) -> AccessResult<Vec<Value>>;

    /// Return the subset of `keys` that exist in the table.
    async fn fetch_existing_keys(
        &self,
        table: &str,
        primary_key: &str,
        keys: &[Value],
    ) -> AccessResult<Vec<Value>>;

    /// Execute one statement and return the number of affected rows.
    async fn execute(&self, statement: &Statement) -> AccessResult<u64>;

    /// Execute statements in order inside a single transaction. Either all
    /// of them take effect or none do.
    ///
    /// Each statement is bounded by `timeout` where it runs, not just where it
    /// is awaited: a statement that exceeds it is cancelled, the transaction
    /// rolls back and [`AccessError::Timeout`] is returned.
    async fn execute_in_transaction(
        &self,
        statements: &[Statement],
        timeout: Duration,
    ) -> AccessResult<u64>;
}

/// Run `statements` in one transaction, each bounded by `timeout`.
///
/// A statement that times out has not taken effect and is not retried.
pub async fn execute_with_timeout(
    db: &dyn DatabaseAccess,
    statements: &[Statement],
    timeout: Duration,
) -> AccessResult<u64> {
    if statements.is_empty() {
        return Ok(0);
    }
    db.execute_in_transaction(statements, timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_number_placeholders_in_bind_order() {
        let mut params = Params::new();
        assert_eq!(params.bind(Value::Int(1)), "$1");
        assert_eq!(params.bind(Value::from("a")), "$2");
        assert_eq!(params.len(), 2);

        let stmt = params.into_statement("SELECT $1, $2".to_string());
        assert_eq!(stmt.params, vec![Value::Int(1), Value::from("a")]);
    }
}
