// ABOUTME: Schema Introspector - reads source column layout and mirrors it at the destination
// ABOUTME: Builds CREATE TABLE IF NOT EXISTS from source types, preserving column order

use crate::db::{DatabaseAccess, Statement};
use crate::error::{AccessError, Result, SyncError};
use crate::utils::{quote_ident, validate_type_name};

/// A column as discovered on the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Rendered SQL type, copied verbatim into the destination DDL
    pub data_type: String,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
        }
    }
}

/// Layout of one table. Column order is the source's ordinal order and is
/// never re-sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// The single primary key column used for paging, upserts and deletion.
    pub fn key_column(&self) -> Result<&str> {
        match self.primary_key.as_slice() {
            [pk] => Ok(pk.as_str()),
            [] => Err(SyncError::UnsupportedTable {
                table: self.name.clone(),
                reason: "no primary key".to_string(),
            }),
            many => Err(SyncError::UnsupportedTable {
                table: self.name.clone(),
                reason: format!("composite primary key ({}) is not supported", many.join(", ")),
            }),
        }
    }
}

/// Read the ordered column list and primary key of `table` from the source.
pub async fn describe_columns(source: &dyn DatabaseAccess, table: &str) -> Result<TableSchema> {
    let schema = source.describe_table(table).await.map_err(|e| {
        SyncError::classify(source.name(), e, |source| SyncError::SchemaRead {
            table: table.to_string(),
            source,
        })
    })?;

    // A table that vanished between listing and introspection comes back empty
    if schema.columns.is_empty() {
        return Err(SyncError::SchemaRead {
            table: table.to_string(),
            source: AccessError::Query(anyhow::anyhow!(
                "table has no visible columns (dropped or privileges revoked)"
            )),
        });
    }

    Ok(schema)
}

/// Build the DDL that mirrors `schema` at the destination.
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS "users" (
///   "id" bigint NOT NULL, "email" character varying(255) NULL,
///   PRIMARY KEY ("id"))
/// ```
pub fn build_create_table(schema: &TableSchema) -> anyhow::Result<Statement> {
    let mut definitions = Vec::with_capacity(schema.columns.len() + 1);
    for column in &schema.columns {
        validate_type_name(&column.data_type)?;
        definitions.push(format!(
            "{} {} {}",
            quote_ident(&column.name),
            column.data_type,
            if column.nullable { "NULL" } else { "NOT NULL" }
        ));
    }

    if !schema.primary_key.is_empty() {
        let pk: Vec<String> = schema.primary_key.iter().map(|c| quote_ident(c)).collect();
        definitions.push(format!("PRIMARY KEY ({})", pk.join(", ")));
    }

    Ok(Statement::new(
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&schema.name),
            definitions.join(", ")
        ),
        Vec::new(),
    ))
}

/// Create the destination table if it is missing.
///
/// An existing table is trusted as-is; column drift is not reconciled.
/// Returns true when the table was created by this call.
pub async fn ensure_table_exists(target: &dyn DatabaseAccess, schema: &TableSchema) -> Result<bool> {
    let exists = target.table_exists(&schema.name).await.map_err(|e| {
        SyncError::classify(target.name(), e, |source| SyncError::SchemaRead {
            table: schema.name.clone(),
            source,
        })
    })?;

    if exists {
        return Ok(false);
    }

    let statement = build_create_table(schema).map_err(|e| SyncError::SchemaRead {
        table: schema.name.clone(),
        source: AccessError::Query(e),
    })?;

    tracing::info!(
        "Creating table {} on {} ({} columns)",
        schema.name,
        target.name(),
        schema.columns.len()
    );

    target.execute(&statement).await.map_err(|e| {
        SyncError::classify(target.name(), e, |source| SyncError::Write {
            table: schema.name.clone(),
            source,
        })
    })?;

    Ok(true)
}
