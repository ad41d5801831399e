// ABOUTME: Upsert Executor - writes a chunk of records to the destination with bound parameters
// ABOUTME: Supports INSERT ... ON CONFLICT and a CASE-per-column update plus bulk insert

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::db::{execute_with_timeout, DatabaseAccess, Params, Statement};
use crate::error::{Result, SyncError};
use crate::schema::TableSchema;
use crate::utils::quote_ident;
use crate::value::{Record, Value};

/// PostgreSQL accepts at most 65535 bind parameters per statement; leave some margin.
pub const MAX_BIND_PARAMS: usize = 65_000;

/// How existing destination rows are overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum UpsertStrategy {
    /// One `INSERT ... ON CONFLICT (pk) DO UPDATE SET` per batch
    #[default]
    OnConflict,
    /// Look up which keys exist, bulk insert the rest, and update existing rows
    /// with one `CASE pk WHEN .. THEN ..` statement per column
    CaseUpdate,
}

/// Writes chunks of records into one destination table.
pub struct UpsertExecutor<'a> {
    target: &'a dyn DatabaseAccess,
    strategy: UpsertStrategy,
    statement_timeout: Duration,
}

impl<'a> UpsertExecutor<'a> {
    pub fn new(
        target: &'a dyn DatabaseAccess,
        strategy: UpsertStrategy,
        statement_timeout: Duration,
    ) -> Self {
        Self {
            target,
            strategy,
            statement_timeout,
        }
    }

    /// Insert `records`, overwriting every column of rows whose key already exists.
    ///
    /// The column list always comes from `schema`, never from the records, so
    /// callers must validate records first (see [`Record::validate`]). All
    /// statements for the chunk run in one destination transaction.
    ///
    /// # Returns
    ///
    /// The number of rows inserted or updated.
    pub async fn upsert(&self, schema: &TableSchema, records: Vec<Record>) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let pk = schema.key_column()?;
        let columns = schema.column_names();
        let pk_idx = columns
            .iter()
            .position(|c| c == pk)
            .ok_or_else(|| SyncError::UnsupportedTable {
                table: schema.name.clone(),
                reason: format!("primary key column '{}' is not in the column list", pk),
            })?;

        let rows: Vec<Vec<Value>> = records
            .into_iter()
            .map(|r| r.into_values(&columns))
            .collect();

        match self.strategy {
            UpsertStrategy::OnConflict => {
                let batch_size = std::cmp::max(1, MAX_BIND_PARAMS / columns.len());
                let statements: Vec<Statement> = rows
                    .chunks(batch_size)
                    .map(|batch| build_upsert_statement(&schema.name, &columns, pk, batch))
                    .collect();
                self.run(&schema.name, &statements).await
            }
            UpsertStrategy::CaseUpdate => {
                // Each row costs three parameters per CASE statement
                let batch_size = std::cmp::max(1, MAX_BIND_PARAMS / columns.len().max(3));
                let mut statements = Vec::new();
                let mut affected = 0u64;

                for batch in rows.chunks(batch_size) {
                    let keys: Vec<Value> = batch.iter().map(|row| row[pk_idx].clone()).collect();
                    let existing = self
                        .target
                        .fetch_existing_keys(&schema.name, pk, &keys)
                        .await
                        .map_err(|e| self.write_error(&schema.name, e))?;

                    let (updates, inserts): (Vec<Vec<Value>>, Vec<Vec<Value>>) = batch
                        .iter()
                        .cloned()
                        .partition(|row| existing.contains(&row[pk_idx]));

                    if !inserts.is_empty() {
                        statements.push(build_insert_statement(&schema.name, &columns, &inserts));
                    }
                    statements.extend(build_case_update_statements(
                        &schema.name,
                        &columns,
                        pk_idx,
                        &updates,
                    ));
                    affected += (inserts.len() + updates.len()) as u64;
                }

                self.run(&schema.name, &statements).await?;
                Ok(affected)
            }
        }
    }

    async fn run(&self, table: &str, statements: &[Statement]) -> Result<u64> {
        execute_with_timeout(self.target, statements, self.statement_timeout)
            .await
            .map_err(|e| self.write_error(table, e))
    }

    fn write_error(&self, table: &str, err: crate::error::AccessError) -> SyncError {
        SyncError::classify(self.target.name(), err, |source| SyncError::Write {
            table: table.to_string(),
            source,
        })
    }
}

fn values_clause(params: &mut Params, rows: &[Vec<Value>]) -> String {
    rows.iter()
        .map(|row| {
            let placeholders: Vec<String> = row.iter().map(|v| params.bind(v.clone())).collect();
            format!("({})", placeholders.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build an upsert for a batch of rows (values in `columns` order).
///
/// ```sql
/// INSERT INTO "users" ("id", "email") VALUES ($1, $2), ($3, $4)
/// ON CONFLICT ("id") DO UPDATE SET "email" = EXCLUDED."email"
/// ```
pub fn build_upsert_statement(
    table: &str,
    columns: &[String],
    primary_key: &str,
    rows: &[Vec<Value>],
) -> Statement {
    let mut params = Params::new();
    let values = values_clause(&mut params, rows);

    let update_columns: Vec<String> = columns
        .iter()
        .filter(|c| c.as_str() != primary_key)
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();

    let conflict_action = if update_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_columns.join(", "))
    };

    let sql = format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) {}",
        quote_ident(table),
        column_list(columns),
        values,
        quote_ident(primary_key),
        conflict_action
    );
    params.into_statement(sql)
}

/// Plain bulk insert, used for rows known to be absent at the destination.
pub fn build_insert_statement(table: &str, columns: &[String], rows: &[Vec<Value>]) -> Statement {
    let mut params = Params::new();
    let values = values_clause(&mut params, rows);
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(table),
        column_list(columns),
        values
    );
    params.into_statement(sql)
}

/// One statement per non-key column, mapping each key to its new value and
/// scoped to just the keys being updated.
///
/// ```sql
/// UPDATE "users" SET "email" = CASE "id" WHEN $1 THEN $2 WHEN $3 THEN $4
/// ELSE "email" END WHERE "id" IN ($5, $6)
/// ```
pub fn build_case_update_statements(
    table: &str,
    columns: &[String],
    pk_idx: usize,
    rows: &[Vec<Value>],
) -> Vec<Statement> {
    if rows.is_empty() {
        return Vec::new();
    }

    let pk = quote_ident(&columns[pk_idx]);

    columns
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != pk_idx)
        .map(|(idx, column)| {
            let column = quote_ident(column);
            let mut params = Params::new();

            let branches: Vec<String> = rows
                .iter()
                .map(|row| {
                    let key = params.bind(row[pk_idx].clone());
                    let value = params.bind(row[idx].clone());
                    format!("WHEN {} THEN {}", key, value)
                })
                .collect();

            let keys: Vec<String> = rows
                .iter()
                .map(|row| params.bind(row[pk_idx].clone()))
                .collect();

            let sql = format!(
                "UPDATE {table} SET {column} = CASE {pk} {branches} ELSE {column} END WHERE {pk} IN ({keys})",
                table = quote_ident(table),
                column = column,
                pk = pk,
                branches = branches.join(" "),
                keys = keys.join(", ")
            );
            params.into_statement(sql)
        })
        .collect()
}
