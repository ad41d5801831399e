// ABOUTME: PostgreSQL implementation of the DatabaseAccess capability
// ABOUTME: Catalog queries, keyset paging helpers and transactional statement execution

use anyhow::Context;
use async_trait::async_trait;
use deadpool_postgres::{Object, Pool, PoolError};
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;

use super::connection::create_pool;
use super::types::{read_value, row_to_record};
use crate::db::{AccessResult, DatabaseAccess, Statement};
use crate::error::AccessError;
use crate::schema::{Column, TableSchema};
use crate::utils::quote_ident;
use crate::value::{Record, Value};

/// A named PostgreSQL database backed by a connection pool.
pub struct PostgresDatabase {
    name: String,
    pool: Pool,
}

impl PostgresDatabase {
    /// Connect to `url`, resolving table names in `schema`.
    pub async fn connect(
        name: &str,
        url: &str,
        schema: &str,
        pool_size: usize,
    ) -> anyhow::Result<Self> {
        let pool = create_pool(url, schema, pool_size)
            .await
            .with_context(|| format!("Failed to connect to the {} database", name))?;
        Ok(Self {
            name: name.to_string(),
            pool,
        })
    }

    async fn client(&self) -> AccessResult<Object> {
        self.pool.get().await.map_err(|e| pool_error(&self.name, e))
    }
}

fn pool_error(name: &str, err: PoolError) -> AccessError {
    AccessError::Connection(
        anyhow::Error::new(err).context(format!("Failed to get a connection to {}", name)),
    )
}

/// Closed connections are run-fatal; everything else is a failed query.
fn query_error(err: tokio_postgres::Error, context: String) -> AccessError {
    if err.is_closed() {
        AccessError::Connection(anyhow::Error::new(err).context(context))
    } else {
        AccessError::Query(anyhow::Error::new(err).context(context))
    }
}

/// Like [`query_error`], but a statement cancelled by `statement_timeout`
/// becomes [`AccessError::Timeout`].
fn statement_error(err: tokio_postgres::Error, timeout: Duration, context: String) -> AccessError {
    if err.code() == Some(&SqlState::QUERY_CANCELED) {
        tracing::debug!("{}: {}", context, err);
        AccessError::Timeout(timeout)
    } else {
        query_error(err, context)
    }
}

/// `SET LOCAL` value for `timeout`, in milliseconds. Zero would disable the
/// timeout, so it is clamped to 1ms.
fn statement_timeout_setting(timeout: Duration) -> String {
    format!("SET LOCAL statement_timeout = {}", timeout.as_millis().max(1))
}

fn bind(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl DatabaseAccess for PostgresDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> AccessResult<()> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await.map_err(|e| {
            AccessError::Connection(anyhow::Error::new(e).context(format!("{} did not answer", self.name)))
        })?;
        Ok(())
    }

    async fn list_tables(&self) -> AccessResult<Vec<String>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT tablename FROM pg_tables
                 WHERE schemaname = current_schema()
                 ORDER BY tablename",
                &[],
            )
            .await
            .map_err(|e| query_error(e, format!("Failed to list tables on {}", self.name)))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn table_exists(&self, table: &str) -> AccessResult<bool> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT EXISTS (
                    SELECT 1 FROM pg_tables
                    WHERE schemaname = current_schema() AND tablename = $1
                 )",
                &[&table],
            )
            .await
            .map_err(|e| query_error(e, format!("Failed to check whether {} exists", table)))?;
        Ok(row.get(0))
    }

    async fn describe_table(&self, table: &str) -> AccessResult<TableSchema> {
        let client = self.client().await?;

        let rows = client
            .query(
                "SELECT a.attname, format_type(a.atttypid, a.atttypmod), NOT a.attnotnull
                 FROM pg_attribute a
                 JOIN pg_class c ON c.oid = a.attrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname = current_schema()
                   AND c.relname = $1
                   AND a.attnum > 0
                   AND NOT a.attisdropped
                 ORDER BY a.attnum",
                &[&table],
            )
            .await
            .map_err(|e| query_error(e, format!("Failed to get columns for {}", table)))?;

        let columns = rows
            .iter()
            .map(|row| Column::new(row.get::<_, String>(0), row.get::<_, String>(1), row.get(2)))
            .collect();

        let rows = client
            .query(
                "SELECT a.attname
                 FROM pg_index i
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                 JOIN pg_class c ON c.oid = i.indrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE i.indisprimary
                   AND n.nspname = current_schema()
                   AND c.relname = $1
                 ORDER BY array_position(i.indkey, a.attnum)",
                &[&table],
            )
            .await
            .map_err(|e| query_error(e, format!("Failed to get primary key for {}", table)))?;

        Ok(TableSchema {
            name: table.to_string(),
            columns,
            primary_key: rows.iter().map(|row| row.get(0)).collect(),
        })
    }

    async fn count(&self, table: &str) -> AccessResult<i64> {
        let client = self.client().await?;
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let row = client
            .query_one(&sql, &[])
            .await
            .map_err(|e| query_error(e, format!("Failed to count rows in {}", table)))?;
        Ok(row.get(0))
    }

    async fn fetch_page(
        &self,
        table: &str,
        columns: &[String],
        order_by: &str,
        offset: u64,
        limit: u64,
    ) -> AccessResult<Vec<Record>> {
        let client = self.client().await?;
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {} LIMIT $1 OFFSET $2",
            column_list,
            quote_ident(table),
            quote_ident(order_by)
        );

        let (limit, offset) = (limit as i64, offset as i64);
        let rows = client
            .query(&sql, &[&limit, &offset])
            .await
            .map_err(|e| query_error(e, format!("Failed to read {} at offset {}", table, offset)))?;

        rows.iter()
            .map(row_to_record)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|e| AccessError::Query(e.context(format!("Failed to decode rows of {}", table))))
    }

    async fn fetch_primary_keys(
        &self,
        table: &str,
        primary_key: &str,
        offset: u64,
        limit: u64,
    ) -> AccessResult<Vec<Value>> {
        let client = self.client().await?;
        let pk = quote_ident(primary_key);
        let sql = format!(
            "SELECT {pk} FROM {table} ORDER BY {pk} LIMIT $1 OFFSET $2",
            pk = pk,
            table = quote_ident(table)
        );

        let (limit, offset) = (limit as i64, offset as i64);
        let rows = client
            .query(&sql, &[&limit, &offset])
            .await
            .map_err(|e| query_error(e, format!("Failed to read keys of {}", table)))?;

        rows.iter()
            .map(|row| read_value(row, 0))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(AccessError::Query)
    }

    async fn fetch_existing_keys(
        &self,
        table: &str,
        primary_key: &str,
        keys: &[Value],
    ) -> AccessResult<Vec<Value>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let client = self.client().await?;
        let placeholders: Vec<String> = (1..=keys.len()).map(|i| format!("${}", i)).collect();
        let pk = quote_ident(primary_key);
        let sql = format!(
            "SELECT {pk} FROM {table} WHERE {pk} IN ({placeholders})",
            pk = pk,
            table = quote_ident(table),
            placeholders = placeholders.join(", ")
        );

        let rows = client
            .query(&sql, &bind(keys))
            .await
            .map_err(|e| query_error(e, format!("Failed to look up existing keys in {}", table)))?;

        rows.iter()
            .map(|row| read_value(row, 0))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(AccessError::Query)
    }

    async fn execute(&self, statement: &Statement) -> AccessResult<u64> {
        let client = self.client().await?;
        client
            .execute(&statement.sql, &bind(&statement.params))
            .await
            .map_err(|e| query_error(e, "Statement failed".to_string()))
    }

    async fn execute_in_transaction(
        &self,
        statements: &[Statement],
        timeout: Duration,
    ) -> AccessResult<u64> {
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| query_error(e, "Failed to begin transaction".to_string()))?;

        // The server cancels overrunning statements, so a timed-out write rolls
        // back instead of committing after the caller gave up on it
        tx.batch_execute(&statement_timeout_setting(timeout))
            .await
            .map_err(|e| query_error(e, "Failed to set statement timeout".to_string()))?;

        let mut affected = 0u64;
        for (i, statement) in statements.iter().enumerate() {
            affected += tx
                .execute(&statement.sql, &bind(&statement.params))
                .await
                .map_err(|e| {
                    statement_error(
                        e,
                        timeout,
                        format!("Statement {} of {} failed", i + 1, statements.len()),
                    )
                })?;
        }

        tx.commit()
            .await
            .map_err(|e| statement_error(e, timeout, "Failed to commit transaction".to_string()))?;
        Ok(affected)
    }
}
