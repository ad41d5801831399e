// ABOUTME: In-memory DatabaseAccess used by the sync integration tests
// ABOUTME: Interprets the INSERT/UPDATE/DELETE/CREATE shapes the engine generates

#![allow(dead_code)]

use async_trait::async_trait;
use staging_sync::db::{AccessResult, DatabaseAccess, Statement};
use staging_sync::schema::{Column, TableSchema};
use staging_sync::{AccessError, Record, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a database sorts text keys, standing in for its collation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyOrder {
    /// Byte order, like the "C" collation
    #[default]
    Binary,
    /// Letters compare case-insensitively, like most natural-language collations
    CaseInsensitive,
}

#[derive(Debug, Clone)]
struct FakeTable {
    schema: TableSchema,
    rows: Vec<Record>,
    order: KeyOrder,
}

impl FakeTable {
    fn pk(&self) -> &str {
        &self.schema.primary_key[0]
    }

    fn key_of<'a>(&self, record: &'a Record) -> &'a Value {
        record.get(self.pk()).expect("row without key")
    }

    fn sort(&mut self) {
        let pk = self.pk().to_string();
        let order = self.order;
        self.rows
            .sort_by(|a, b| key_cmp_in(order, a.get(&pk).unwrap(), b.get(&pk).unwrap()));
    }

    fn position(&self, key: &Value) -> Option<usize> {
        self.rows.iter().position(|r| self.key_of(r) == key)
    }
}

/// Total order over the key types the tests use.
pub fn key_cmp(a: &Value, b: &Value) -> Ordering {
    key_cmp_in(KeyOrder::Binary, a, b)
}

fn key_cmp_in(order: KeyOrder, a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Text(a), Value::Text(b)) if order == KeyOrder::CaseInsensitive => a
            .to_lowercase()
            .cmp(&b.to_lowercase())
            .then_with(|| a.cmp(b)),
        (Value::Text(a), Value::Text(b)) => a.cmp(b),
        (Value::Uuid(a), Value::Uuid(b)) => a.cmp(b),
        _ => panic!("unsupported key comparison {:?} vs {:?}", a, b),
    }
}

/// Build a record from column/value pairs.
pub fn record(pairs: &[(&str, Value)]) -> Record {
    pairs
        .iter()
        .map(|(c, v)| (c.to_string(), v.clone()))
        .collect()
}

/// `users` rows with the given ids and emails.
pub fn user(id: i64, email: &str) -> Record {
    record(&[("id", Value::Int(id)), ("email", Value::from(email))])
}

pub const USER_COLUMNS: &[(&str, &str)] = &[("id", "bigint"), ("email", "text")];

/// An in-memory database. Cloning shares the underlying state.
#[derive(Clone)]
pub struct FakeDatabase {
    name: String,
    order: KeyOrder,
    tables: Arc<Mutex<BTreeMap<String, FakeTable>>>,
    disconnected: Arc<AtomicBool>,
    failing_fetches: Arc<Mutex<BTreeSet<(String, u64)>>>,
    fetch_disconnects: Arc<Mutex<BTreeSet<String>>>,
    failing_writes: Arc<Mutex<BTreeSet<String>>>,
    unknown_column_tables: Arc<Mutex<BTreeSet<String>>>,
    fetch_log: Arc<Mutex<Vec<(String, u64)>>>,
    statements: Arc<AtomicUsize>,
    slow_inserts: Arc<Mutex<BTreeMap<String, Duration>>>,
    slow_insert_attempts: Arc<AtomicUsize>,
}

impl FakeDatabase {
    pub fn new(name: &str) -> Self {
        Self::with_key_order(name, KeyOrder::Binary)
    }

    /// A database whose tables keep their rows sorted by `order`.
    pub fn with_key_order(name: &str, order: KeyOrder) -> Self {
        Self {
            name: name.to_string(),
            order,
            tables: Arc::default(),
            disconnected: Arc::default(),
            failing_fetches: Arc::default(),
            fetch_disconnects: Arc::default(),
            failing_writes: Arc::default(),
            unknown_column_tables: Arc::default(),
            fetch_log: Arc::default(),
            statements: Arc::default(),
            slow_inserts: Arc::default(),
            slow_insert_attempts: Arc::default(),
        }
    }

    pub fn shared(&self) -> Arc<dyn DatabaseAccess> {
        Arc::new(self.clone())
    }

    /// Create a table with a primary key on `primary_key` (empty for none).
    pub fn create_table(
        &self,
        table: &str,
        columns: &[(&str, &str)],
        primary_key: &[&str],
        rows: Vec<Record>,
    ) {
        let schema = TableSchema {
            name: table.to_string(),
            columns: columns
                .iter()
                .map(|(name, ty)| Column::new(*name, *ty, *name != primary_key.first().copied().unwrap_or("")))
                .collect(),
            primary_key: primary_key.iter().map(|s| s.to_string()).collect(),
        };
        let mut fake = FakeTable {
            schema,
            rows,
            order: self.order,
        };
        if !fake.schema.primary_key.is_empty() {
            fake.sort();
        }
        self.tables.lock().unwrap().insert(table.to_string(), fake);
    }

    pub fn users(&self, rows: Vec<Record>) {
        self.create_table("users", USER_COLUMNS, &["id"], rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn schema(&self, table: &str) -> Option<TableSchema> {
        self.tables.lock().unwrap().get(table).map(|t| t.schema.clone())
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.lock().unwrap().contains_key(table)
    }

    pub fn insert_row(&self, table: &str, row: Record) {
        let mut tables = self.tables.lock().unwrap();
        let fake = tables.get_mut(table).expect("no such table");
        fake.rows.push(row);
        fake.sort();
    }

    pub fn delete_row(&self, table: &str, key: &Value) {
        let mut tables = self.tables.lock().unwrap();
        let fake = tables.get_mut(table).expect("no such table");
        if let Some(idx) = fake.position(key) {
            fake.rows.remove(idx);
        }
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, AtomicOrdering::SeqCst);
    }

    pub fn fail_fetch(&self, table: &str, offset: u64) {
        self.failing_fetches
            .lock()
            .unwrap()
            .insert((table.to_string(), offset));
    }

    /// Make page reads of `table` report a lost connection.
    pub fn disconnect_on_fetch(&self, table: &str) {
        self.fetch_disconnects.lock().unwrap().insert(table.to_string());
    }

    pub fn fail_writes(&self, table: &str) {
        self.failing_writes.lock().unwrap().insert(table.to_string());
    }

    /// Make page reads of `table` carry a column the schema doesn't know.
    pub fn add_unknown_column(&self, table: &str) {
        self.unknown_column_tables
            .lock()
            .unwrap()
            .insert(table.to_string());
    }

    pub fn fetched_offsets(&self, table: &str) -> Vec<u64> {
        let mut offsets: Vec<u64> = self
            .fetch_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, o)| *o)
            .collect();
        offsets.sort();
        offsets
    }

    pub fn statement_count(&self) -> usize {
        self.statements.load(AtomicOrdering::SeqCst)
    }

    /// Make every INSERT into `table` take `delay`, like a slow trigger would.
    /// A transaction whose insert runs past its timeout is cancelled and rolled
    /// back, the way a server-side statement timeout behaves.
    pub fn delay_inserts(&self, table: &str, delay: Duration) {
        self.slow_inserts
            .lock()
            .unwrap()
            .insert(table.to_string(), delay);
    }

    /// Number of delayed INSERTs that were started.
    pub fn slow_insert_attempts(&self) -> usize {
        self.slow_insert_attempts.load(AtomicOrdering::SeqCst)
    }

    /// Time the slow INSERTs among `statements` would take on the server.
    fn insert_delays(&self, statements: &[Statement]) -> Vec<Duration> {
        let slow = self.slow_inserts.lock().unwrap();
        statements
            .iter()
            .filter(|s| s.sql.starts_with("INSERT INTO "))
            .filter_map(|s| {
                let (table, _) = quoted_after(&s.sql, 0);
                slow.get(&table).copied()
            })
            .collect()
    }

    fn check_connection(&self) -> AccessResult<()> {
        if self.disconnected.load(AtomicOrdering::SeqCst) {
            return Err(AccessError::Connection(anyhow::anyhow!(
                "connection to {} closed",
                self.name
            )));
        }
        Ok(())
    }

    fn apply(&self, tables: &mut BTreeMap<String, FakeTable>, statement: &Statement) -> AccessResult<u64> {
        self.statements.fetch_add(1, AtomicOrdering::SeqCst);
        let sql = statement.sql.as_str();

        let failing = self.failing_writes.lock().unwrap().clone();
        if failing.iter().any(|t| sql.contains(&format!("\"{}\"", t))) {
            return Err(AccessError::Query(anyhow::anyhow!("permission denied")));
        }

        if sql.starts_with("CREATE TABLE IF NOT EXISTS ") {
            apply_create(tables, sql, self.order)
        } else if sql.starts_with("INSERT INTO ") {
            apply_insert(tables, statement)
        } else if sql.starts_with("UPDATE ") {
            apply_case_update(tables, statement)
        } else if sql.starts_with("DELETE FROM ") {
            apply_delete(tables, statement)
        } else {
            Err(AccessError::Query(anyhow::anyhow!("unsupported statement: {}", sql)))
        }
    }

    fn with_table<T>(
        &self,
        table: &str,
        f: impl FnOnce(&FakeTable) -> T,
    ) -> AccessResult<T> {
        self.check_connection()?;
        let tables = self.tables.lock().unwrap();
        let fake = tables.get(table).ok_or_else(|| {
            AccessError::Query(anyhow::anyhow!("relation \"{}\" does not exist", table))
        })?;
        Ok(f(fake))
    }
}

/// Text between the first pair of double quotes at or after `from`.
fn quoted_after(sql: &str, from: usize) -> (String, usize) {
    let start = sql[from..].find('"').unwrap() + from + 1;
    let end = sql[start..].find('"').unwrap() + start;
    (sql[start..end].to_string(), end + 1)
}

fn apply_create(
    tables: &mut BTreeMap<String, FakeTable>,
    sql: &str,
    order: KeyOrder,
) -> AccessResult<u64> {
    let (name, pos) = quoted_after(sql, 0);
    if tables.contains_key(&name) {
        return Ok(0);
    }

    let body = &sql[sql[pos..].find('(').unwrap() + pos + 1..sql.len() - 1];
    let mut columns = Vec::new();
    let mut primary_key = Vec::new();

    for definition in body.split(", \"").map(|d| d.trim_start_matches('"')) {
        let (column, rest) = definition.split_once('"').unwrap();
        let rest = rest.trim();
        let (ty, rest) = if let Some(ty) = rest.strip_suffix(" NOT NULL") {
            (ty, "")
        } else if let Some((ty, pk)) = rest.split_once(" NOT NULL, PRIMARY KEY (") {
            (ty, pk)
        } else if let Some((ty, pk)) = rest.split_once(" NULL, PRIMARY KEY (") {
            (ty, pk)
        } else {
            (rest.trim_end_matches(" NULL"), "")
        };
        let nullable = !definition.contains(" NOT NULL");
        columns.push(Column::new(column, ty, nullable));
        for key in rest.trim_end_matches(')').split(", ").filter(|k| !k.is_empty()) {
            primary_key.push(key.trim_matches('"').to_string());
        }
    }

    tables.insert(
        name.clone(),
        FakeTable {
            schema: TableSchema {
                name,
                columns,
                primary_key,
            },
            rows: Vec::new(),
            order,
        },
    );
    Ok(0)
}

fn apply_insert(tables: &mut BTreeMap<String, FakeTable>, statement: &Statement) -> AccessResult<u64> {
    let sql = statement.sql.as_str();
    let (table, pos) = quoted_after(sql, 0);
    let open = sql[pos..].find('(').unwrap() + pos;
    let close = sql[open..].find(')').unwrap() + open;
    let columns: Vec<String> = sql[open + 1..close]
        .split(", ")
        .map(|c| c.trim_matches('"').to_string())
        .collect();

    let fake = tables
        .get_mut(&table)
        .ok_or_else(|| AccessError::Query(anyhow::anyhow!("relation \"{}\" does not exist", table)))?;
    let on_conflict_update = sql.contains("DO UPDATE SET");
    let on_conflict_nothing = sql.contains("DO NOTHING");

    let mut affected = 0;
    for values in statement.params.chunks(columns.len()) {
        let row: Record = columns.iter().cloned().zip(values.iter().cloned()).collect();
        match fake.position(fake.key_of(&row)) {
            Some(idx) if on_conflict_update => {
                fake.rows[idx] = row;
                affected += 1;
            }
            Some(_) if on_conflict_nothing => {}
            Some(_) => {
                return Err(AccessError::Query(anyhow::anyhow!(
                    "duplicate key value violates unique constraint on {}",
                    table
                )))
            }
            None => {
                fake.rows.push(row);
                affected += 1;
            }
        }
    }
    fake.sort();
    Ok(affected)
}

fn apply_case_update(tables: &mut BTreeMap<String, FakeTable>, statement: &Statement) -> AccessResult<u64> {
    let sql = statement.sql.as_str();
    let (table, pos) = quoted_after(sql, 0);
    let (column, _) = quoted_after(sql, pos);
    let branches = sql.matches(" WHEN ").count();

    let fake = tables
        .get_mut(&table)
        .ok_or_else(|| AccessError::Query(anyhow::anyhow!("relation \"{}\" does not exist", table)))?;

    let mut affected = 0;
    for pair in statement.params[..branches * 2].chunks(2) {
        if let Some(idx) = fake.position(&pair[0]) {
            fake.rows[idx].set(column.clone(), pair[1].clone());
            affected += 1;
        }
    }
    Ok(affected)
}

fn apply_delete(tables: &mut BTreeMap<String, FakeTable>, statement: &Statement) -> AccessResult<u64> {
    let sql = statement.sql.as_str();
    let (table, _) = quoted_after(sql, 0);
    let fake = tables
        .get_mut(&table)
        .ok_or_else(|| AccessError::Query(anyhow::anyhow!("relation \"{}\" does not exist", table)))?;

    // Either the whole table or the listed keys
    let keys = &statement.params;
    let everything = !sql.contains(" WHERE ");

    let pk = fake.pk().to_string();
    let before = fake.rows.len();
    fake.rows
        .retain(|row| !(everything || keys.contains(row.get(&pk).unwrap())));
    Ok((before - fake.rows.len()) as u64)
}

#[async_trait]
impl DatabaseAccess for FakeDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> AccessResult<()> {
        self.check_connection()
    }

    async fn list_tables(&self) -> AccessResult<Vec<String>> {
        self.check_connection()?;
        Ok(self.tables.lock().unwrap().keys().cloned().collect())
    }

    async fn table_exists(&self, table: &str) -> AccessResult<bool> {
        self.check_connection()?;
        Ok(self.has_table(table))
    }

    async fn describe_table(&self, table: &str) -> AccessResult<TableSchema> {
        self.check_connection()?;
        Ok(self.schema(table).unwrap_or(TableSchema {
            name: table.to_string(),
            columns: Vec::new(),
            primary_key: Vec::new(),
        }))
    }

    async fn count(&self, table: &str) -> AccessResult<i64> {
        self.with_table(table, |t| t.rows.len() as i64)
    }

    async fn fetch_page(
        &self,
        table: &str,
        columns: &[String],
        _order_by: &str,
        offset: u64,
        limit: u64,
    ) -> AccessResult<Vec<Record>> {
        self.check_connection()?;
        self.fetch_log
            .lock()
            .unwrap()
            .push((table.to_string(), offset));

        if self.fetch_disconnects.lock().unwrap().contains(table) {
            return Err(AccessError::Connection(anyhow::anyhow!("server closed the connection")));
        }
        if self
            .failing_fetches
            .lock()
            .unwrap()
            .contains(&(table.to_string(), offset))
        {
            return Err(AccessError::Query(anyhow::anyhow!("canceling statement")));
        }
        let unknown_column = self.unknown_column_tables.lock().unwrap().contains(table);

        self.with_table(table, |t| {
            t.rows
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .map(|row| {
                    let mut projected: Record = columns
                        .iter()
                        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                        .collect();
                    if unknown_column {
                        projected.set("ghost", Value::Null);
                    }
                    projected
                })
                .collect()
        })
    }

    async fn fetch_primary_keys(
        &self,
        table: &str,
        _primary_key: &str,
        offset: u64,
        limit: u64,
    ) -> AccessResult<Vec<Value>> {
        self.with_table(table, |t| {
            t.rows
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .map(|r| t.key_of(r).clone())
                .collect()
        })
    }

    async fn fetch_existing_keys(
        &self,
        table: &str,
        _primary_key: &str,
        keys: &[Value],
    ) -> AccessResult<Vec<Value>> {
        self.with_table(table, |t| {
            keys.iter()
                .filter(|k| t.position(k).is_some())
                .cloned()
                .collect()
        })
    }

    async fn execute(&self, statement: &Statement) -> AccessResult<u64> {
        self.check_connection()?;
        let mut tables = self.tables.lock().unwrap();
        self.apply(&mut tables, statement)
    }

    async fn execute_in_transaction(
        &self,
        statements: &[Statement],
        timeout: Duration,
    ) -> AccessResult<u64> {
        self.check_connection()?;

        let mut elapsed = Duration::ZERO;
        for delay in self.insert_delays(statements) {
            self.slow_insert_attempts.fetch_add(1, AtomicOrdering::SeqCst);
            if delay > timeout {
                // Cancelled by the server before anything is applied
                tokio::time::sleep(timeout).await;
                return Err(AccessError::Timeout(timeout));
            }
            elapsed += delay;
        }
        if !elapsed.is_zero() {
            tokio::time::sleep(elapsed).await;
        }

        let mut tables = self.tables.lock().unwrap();
        let snapshot = tables.clone();
        let mut affected = 0;
        for statement in statements {
            match self.apply(&mut tables, statement) {
                Ok(n) => affected += n,
                Err(e) => {
                    *tables = snapshot;
                    return Err(e);
                }
            }
        }
        Ok(affected)
    }
}
