// ABOUTME: Obsolete-Row Reconciler - deletes destination rows whose key is gone from the source
// ABOUTME: Checks destination keys page by page against the source by equality, never by range

use std::collections::HashSet;
use std::time::Duration;

use crate::db::{execute_with_timeout, DatabaseAccess, Params, Statement};
use crate::error::{Result, SyncError};
use crate::schema::TableSchema;
use crate::utils::quote_ident;
use crate::value::Value;

/// Outcome of one reconciliation pass over a table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Destination rows removed
    pub deleted: u64,
    /// Destination key pages checked against the source
    pub pages: u64,
    /// Destination keys checked across all pages
    pub keys_checked: u64,
}

/// Removes destination rows that no longer exist at the source.
///
/// Since the upsert pass only ever inserts or overwrites, deletions at the
/// source are invisible to it. The reconciler pages through the destination's
/// primary keys, looks each page up at the source and deletes the keys the
/// source no longer has.
///
/// Keys are only ever compared for equality. Source and destination may sort
/// text keys differently (different collations), so no key range computed on
/// one side is ever evaluated on the other.
///
/// Every key present at the source when its page is looked up survives.
pub struct Reconciler<'a> {
    source: &'a dyn DatabaseAccess,
    target: &'a dyn DatabaseAccess,
    statement_timeout: Duration,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        source: &'a dyn DatabaseAccess,
        target: &'a dyn DatabaseAccess,
        statement_timeout: Duration,
    ) -> Self {
        Self {
            source,
            target,
            statement_timeout,
        }
    }

    /// Reconcile one table, checking at most `chunk_size` keys per page.
    pub async fn reconcile_deletions(
        &self,
        schema: &TableSchema,
        chunk_size: u64,
    ) -> Result<ReconcileOutcome> {
        let table = schema.name.as_str();
        let pk = schema.key_column()?;
        let mut outcome = ReconcileOutcome::default();
        let mut offset = 0u64;

        loop {
            let keys = self
                .target
                .fetch_primary_keys(table, pk, offset, chunk_size)
                .await
                .map_err(|e| {
                    SyncError::classify(self.target.name(), e, |source| SyncError::ChunkFetch {
                        table: table.to_string(),
                        offset,
                        source,
                    })
                })?;
            if keys.is_empty() {
                break;
            }

            let present = self
                .source
                .fetch_existing_keys(table, pk, &keys)
                .await
                .map_err(|e| {
                    SyncError::classify(self.source.name(), e, |source| SyncError::ChunkFetch {
                        table: table.to_string(),
                        offset,
                        source,
                    })
                })?;
            let missing = missing_keys(&keys, &present);

            let deleted = if missing.is_empty() {
                0
            } else {
                self.delete(table, build_key_delete(table, pk, &missing))
                    .await?
            };

            tracing::debug!(
                "Checked {} keys of {} at offset {}: {} rows deleted",
                keys.len(),
                table,
                offset,
                deleted
            );

            outcome.deleted += deleted;
            outcome.pages += 1;
            outcome.keys_checked += keys.len() as u64;

            // Deleted keys no longer occupy a position in the destination
            offset += (keys.len() - missing.len()) as u64;
            if (keys.len() as u64) < chunk_size {
                break;
            }
        }

        if outcome.deleted > 0 {
            tracing::info!(
                "Deleted {} obsolete rows from {} on {} ({} keys checked in {} pages)",
                outcome.deleted,
                table,
                self.target.name(),
                outcome.keys_checked,
                outcome.pages
            );
        } else {
            tracing::debug!(
                "No obsolete rows in {} on {} ({} keys checked in {} pages)",
                table,
                self.target.name(),
                outcome.keys_checked,
                outcome.pages
            );
        }

        Ok(outcome)
    }

    async fn delete(&self, table: &str, statement: Statement) -> Result<u64> {
        execute_with_timeout(self.target, std::slice::from_ref(&statement), self.statement_timeout)
            .await
            .map_err(|e| {
                SyncError::classify(self.target.name(), e, |source| SyncError::Write {
                    table: table.to_string(),
                    source,
                })
            })
    }
}

/// Keys of `page` that are absent from `present`, in page order.
pub fn missing_keys(page: &[Value], present: &[Value]) -> Vec<Value> {
    // Debug output is unique per variant and value, unlike f64 equality
    let present: HashSet<String> = present.iter().map(|k| format!("{:?}", k)).collect();
    page.iter()
        .filter(|k| !present.contains(&format!("{:?}", k)))
        .cloned()
        .collect()
}

/// Delete the rows with the given keys.
///
/// ```sql
/// DELETE FROM "users" WHERE "id" IN ($1, $2)
/// ```
pub fn build_key_delete(table: &str, primary_key: &str, keys: &[Value]) -> Statement {
    let mut params = Params::new();
    let placeholders: Vec<String> = keys.iter().map(|k| params.bind(k.clone())).collect();
    let sql = format!(
        "DELETE FROM {} WHERE {} IN ({})",
        quote_ident(table),
        quote_ident(primary_key),
        placeholders.join(", ")
    );
    params.into_statement(sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_delete_binds_every_key() {
        let keys = vec![Value::Int(3), Value::Int(7)];
        let stmt = build_key_delete("users", "id", &keys);
        assert_eq!(stmt.sql, "DELETE FROM \"users\" WHERE \"id\" IN ($1, $2)");
        assert_eq!(stmt.params, keys);
    }

    #[test]
    fn test_missing_keys_keeps_page_order() {
        let page = vec![Value::from("c"), Value::from("B"), Value::from("a")];
        let present = vec![Value::from("a"), Value::from("c")];
        assert_eq!(missing_keys(&page, &present), vec![Value::from("B")]);
    }

    #[test]
    fn test_missing_keys_compares_exact_values() {
        let page = vec![Value::Int(1), Value::from("1")];
        let present = vec![Value::Int(1)];
        assert_eq!(missing_keys(&page, &present), vec![Value::from("1")]);
        assert!(missing_keys(&page, &page).is_empty());
    }
}
