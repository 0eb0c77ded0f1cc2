#![allow(dead_code)]

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use pgreport::session::{Connector, CursorConnection};
use pgreport::{DriverError, Row};
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

static DECLARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^DECLARE\s+(\w+)\s+SCROLL\s+CURSOR\s+FOR\s+(.*)$").unwrap());
static MOVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^MOVE\s+(ABSOLUTE|RELATIVE)\s+(-?\d+)\s+FROM\s+(\w+)$").unwrap());
static FETCH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^FETCH\s+FORWARD\s+(\d+)\s+FROM\s+(\w+)$").unwrap());
static TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bFROM\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());
static LIMIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\nLIMIT\s+(\d+)$").unwrap());

/// Shared view of everything the mock connections did
pub struct MockState {
    tables: Mutex<HashMap<String, usize>>,
    pub opened: AtomicUsize,
    pub live: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub fail_connect: AtomicBool,
    /// While set, every FETCH waits for a permit on `gate`
    pub hold_fetches: AtomicBool,
    /// FETCHes from cursors over this table wait for a permit on `gate`
    pub held_table: Mutex<Option<String>>,
    /// Statements starting with this prefix wait for a permit on `gate`
    pub held_statement: Mutex<Option<String>>,
    pub gate: Semaphore,
    /// Fetching the row with this id fails like a division by zero would
    poisoned: Mutex<HashMap<String, usize>>,
    pub declared: Mutex<Vec<String>>,
    pub executed: Mutex<Vec<String>>,
}

impl Default for MockState {
    fn default() -> Self {
        MockState {
            tables: Mutex::new(HashMap::new()),
            opened: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            hold_fetches: AtomicBool::new(false),
            held_table: Mutex::new(None),
            held_statement: Mutex::new(None),
            gate: Semaphore::new(0),
            poisoned: Mutex::new(HashMap::new()),
            declared: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
        }
    }
}

impl MockState {
    pub fn declared(&self) -> Vec<String> {
        self.declared.lock().clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn hold(&self, on: bool) {
        self.hold_fetches.store(on, Ordering::SeqCst);
    }

    pub fn hold_table(&self, table: Option<&str>) {
        *self.held_table.lock() = table.map(str::to_string);
    }

    pub fn hold_statement(&self, prefix: Option<&str>) {
        *self.held_statement.lock() = prefix.map(str::to_string);
    }

    fn is_statement_held(&self, sql: &str) -> bool {
        self.held_statement.lock().as_deref().is_some_and(|p| sql.starts_with(p))
    }

    async fn wait_for_gate(&self) {
        let permit = self.gate.acquire().await.unwrap();
        permit.forget();
    }

    fn is_held(&self, table: &str) -> bool {
        self.hold_fetches.load(Ordering::SeqCst) || self.held_table.lock().as_deref() == Some(table)
    }

    pub fn release(&self, fetches: usize) {
        self.gate.add_permits(fetches);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.fail_connect.store(refuse, Ordering::SeqCst);
    }

    fn rows_for(&self, query: &str) -> Result<(String, Vec<Row>), DriverError> {
        let table = TABLE
            .captures(query)
            .map(|c| c[1].to_string())
            .ok_or_else(|| DriverError::with_code("42601", format!("syntax error in {query:?}")))?;
        let count = self
            .tables
            .lock()
            .get(&table)
            .copied()
            .ok_or_else(|| DriverError::with_code("42P01", format!("relation \"{table}\" does not exist")))?;
        Ok((table, (1..=count).map(row).collect()))
    }
}

pub fn row(id: usize) -> Row {
    let value = json!({ "id": id, "name": format!("row-{id}") });
    match value {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    }
}

/// Ids of a page of rows, for compact assertions
pub fn ids(rows: &[Row]) -> Vec<u64> {
    rows.iter().filter_map(|r| r.get("id").and_then(|v| v.as_u64())).collect()
}

/// Connector whose connections emulate PostgreSQL scroll cursors over
/// in-memory tables of `{id, name}` rows
#[derive(Clone, Default)]
pub struct MockConnector {
    pub state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, name: &str, rows: usize) -> Self {
        self.state.tables.lock().insert(name.to_string(), rows);
        self
    }

    pub fn with_poisoned_row(self, table: &str, id: usize) -> Self {
        self.state.poisoned.lock().insert(table.to_string(), id);
        self
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<MockConnection, DriverError> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(DriverError::with_code("08001", "connection refused"));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        self.state.live.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            state: self.state.clone(),
            in_transaction: false,
            aborted: false,
            cursors: HashMap::new(),
        })
    }
}

struct MockCursor {
    table: String,
    rows: Vec<Row>,
    /// 0 is before the first row, `rows.len() + 1` after the last
    position: usize,
    poison: Option<usize>,
}

pub struct MockConnection {
    state: Arc<MockState>,
    in_transaction: bool,
    /// Set by a failed statement; only ROLLBACK is accepted until then
    aborted: bool,
    cursors: HashMap<String, MockCursor>,
}

impl MockConnection {
    fn check_aborted(&self) -> Result<(), DriverError> {
        if self.aborted {
            return Err(DriverError::with_code(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }
        Ok(())
    }

    fn cursor(&mut self, name: &str) -> Result<&mut MockCursor, DriverError> {
        self.cursors
            .get_mut(name)
            .ok_or_else(|| DriverError::with_code("34000", format!("cursor \"{name}\" does not exist")))
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CursorConnection for MockConnection {
    async fn execute(&mut self, sql: &str) -> Result<(), DriverError> {
        self.state.executed.lock().push(sql.to_string());
        if self.state.is_statement_held(sql) {
            self.state.clone().wait_for_gate().await;
        }

        if sql == "ROLLBACK" {
            self.in_transaction = false;
            self.aborted = false;
            self.cursors.clear();
            self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        self.check_aborted()?;
        if sql == "BEGIN" {
            self.in_transaction = true;
            return Ok(());
        }
        if sql == "SELECT 1" {
            return Ok(());
        }
        if let Some(caps) = DECLARE.captures(sql) {
            if !self.in_transaction {
                return Err(DriverError::with_code(
                    "25P01",
                    "DECLARE CURSOR can only be used in transaction blocks",
                ));
            }
            let query = caps[2].to_string();
            if query.contains("BROKEN") {
                return Err(DriverError::with_code("42601", "syntax error at or near \"BROKEN\""));
            }
            let (table, rows) = self.state.rows_for(&query)?;
            self.state.declared.lock().push(query);
            let poison = self.state.poisoned.lock().get(&table).copied();
            self.cursors.insert(
                caps[1].to_string(),
                MockCursor { table, rows, position: 0, poison },
            );
            return Ok(());
        }
        if let Some(caps) = MOVE.captures(sql) {
            let count: i64 = caps[2].parse().unwrap();
            let cursor = self.cursor(&caps[3])?;
            let end = cursor.rows.len() as i64 + 1;
            let target = match &caps[1] {
                "ABSOLUTE" => count,
                _ => cursor.position as i64 + count,
            };
            cursor.position = target.clamp(0, end) as usize;
            return Ok(());
        }
        Err(DriverError::with_code("42601", format!("unsupported statement: {sql}")))
    }

    async fn query(&mut self, sql: &str) -> Result<Vec<Row>, DriverError> {
        self.state.executed.lock().push(sql.to_string());
        self.check_aborted()?;

        if let Some(caps) = FETCH.captures(sql) {
            let table = self.cursor(&caps[2])?.table.clone();
            if self.state.is_held(&table) {
                self.state.clone().wait_for_gate().await;
            }
            let count: usize = caps[1].parse().unwrap();
            let cursor = self.cursor(&caps[2])?;
            let len = cursor.rows.len();
            let first = cursor.position.min(len);
            let last = (cursor.position + count).min(len);
            // Rows are 1-based, so row `id` sits at index `id - 1`
            if cursor.poison.is_some_and(|id| id > first && id <= last) {
                self.aborted = true;
                return Err(DriverError::with_code("22012", "division by zero"));
            }
            let page = cursor.rows[first..last].to_vec();
            cursor.position = if cursor.position + count > len { len + 1 } else { cursor.position + count };
            return Ok(page);
        }

        if sql.contains("BROKEN") {
            return Err(DriverError::with_code("42601", "syntax error at or near \"BROKEN\""));
        }
        let (_, mut rows) = self.state.rows_for(sql)?;
        if let Some(caps) = LIMIT.captures(sql) {
            rows.truncate(caps[1].parse().unwrap());
        }
        Ok(rows)
    }

    fn is_closed(&self) -> bool {
        false
    }
}
