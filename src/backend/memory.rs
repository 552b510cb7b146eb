//! In-process replica backend.
//!
//! Each `MemoryDatabase` keeps an ordered log of committed statements, which
//! is enough to observe whether replicas stayed in step. Faults can be
//! injected per database to simulate an unreachable or misbehaving replica.

use super::{
    BackendConnection, BackendDataSource, BackendLargeObject, BackendResultSet, BackendSavepoint,
    BackendStatement, ByteStream, CharStream,
};
use crate::core::{DbError, Result, Value};
use crate::sql::SqlClassifier;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncReadExt;

lazy_static::lazy_static! {
    static ref SEQUENCES: SqlClassifier = SqlClassifier::new(128, true);
}

#[derive(Default)]
struct DatabaseState {
    committed: Vec<String>,
    next_key: i64,
    sequences: HashMap<String, i64>,
    connections: usize,
}

#[derive(Default)]
struct Faults {
    down: bool,
    fail_next: VecDeque<DbError>,
    delay: Option<Duration>,
}

/// One replica's storage.
pub struct MemoryDatabase {
    name: String,
    key_offset: i64,
    state: Mutex<DatabaseState>,
    faults: Mutex<Faults>,
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_key_offset(name, 0)
    }

    /// Generated keys start after `key_offset`, so replicas can disagree on
    /// them the way independent databases do.
    pub fn with_key_offset(name: impl Into<String>, key_offset: i64) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            key_offset,
            state: Mutex::new(DatabaseState::default()),
            faults: Mutex::new(Faults::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_source(self: &Arc<Self>) -> Arc<dyn BackendDataSource> {
        Arc::new(MemoryDataSource {
            database: Arc::clone(self),
        })
    }

    /// Committed statements in commit order
    pub fn committed(&self) -> Vec<String> {
        self.state().committed.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections
    }

    pub fn sequence_value(&self, sequence: &str) -> Option<i64> {
        self.state().sequences.get(&sequence.to_lowercase()).copied()
    }

    /// Make every call fail with a connection error until cleared
    pub fn set_down(&self, down: bool) {
        self.faults().down = down;
    }

    pub fn is_down(&self) -> bool {
        self.faults().down
    }

    /// Fail the next call (of any kind) with `error`. Queued errors are
    /// consumed in order.
    pub fn fail_next(&self, error: DbError) {
        self.faults().fail_next.push_back(error);
    }

    /// Delay every call, e.g. to trip replica timeouts
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.faults().delay = delay;
    }

    async fn check(&self) -> Result<()> {
        let delay = self.faults().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut faults = self.faults();
        if faults.down {
            return Err(DbError::ConnectionError(format!(
                "replica '{}' is unreachable",
                self.name
            )));
        }
        match faults.fail_next.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit_entries(&self, entries: impl IntoIterator<Item = String>) {
        self.state().committed.extend(entries);
    }

    fn next_key(&self) -> i64 {
        let mut state = self.state();
        state.next_key += 1;
        state.next_key + self.key_offset
    }

    /// Advance every sequence the statement references and annotate it with
    /// the values it drew.
    fn draw_sequences(&self, sql: &str) -> (String, Vec<i64>) {
        let traits = SEQUENCES.classify(sql);
        if traits.sequences.is_empty() {
            return (sql.to_string(), Vec::new());
        }

        let mut state = self.state();
        let mut drawn = Vec::with_capacity(traits.sequences.len());
        let mut notes = Vec::with_capacity(traits.sequences.len());
        for sequence in &traits.sequences {
            let value = state.sequences.entry(sequence.clone()).or_insert(0);
            *value += 1;
            drawn.push(*value);
            notes.push(format!("{}={}", sequence, value));
        }
        (format!("{} /* {} */", sql, notes.join(", ")), drawn)
    }
}

struct MemoryDataSource {
    database: Arc<MemoryDatabase>,
}

#[async_trait]
impl BackendDataSource for MemoryDataSource {
    async fn connect(&self) -> Result<Arc<dyn BackendConnection>> {
        self.database.check().await?;
        self.database.state().connections += 1;
        Ok(Arc::new(MemoryConnection {
            session: Arc::new(Session {
                database: self.database.clone(),
                auto_commit: AtomicBool::new(true),
                pending: Mutex::new(Vec::new()),
                savepoints: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }))
    }
}

/// State shared by a connection and the objects it creates
struct Session {
    database: Arc<MemoryDatabase>,
    auto_commit: AtomicBool,
    pending: Mutex<Vec<String>>,
    savepoints: Mutex<Vec<(String, usize)>>,
    closed: AtomicBool,
}

impl Session {
    async fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::Closed("connection".to_string()));
        }
        self.database.check().await
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn savepoints(&self) -> std::sync::MutexGuard<'_, Vec<(String, usize)>> {
        self.savepoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, entry: String) {
        if self.auto_commit.load(Ordering::SeqCst) {
            self.database.commit_entries([entry]);
        } else {
            self.pending().push(entry);
        }
    }

    fn write(&self, sql: &str) -> u64 {
        let (entry, _) = self.database.draw_sequences(sql);
        self.apply(entry);
        1
    }

    fn query(self: &Arc<Self>, sql: &str) -> Arc<dyn BackendResultSet> {
        let (_, drawn) = self.database.draw_sequences(sql);
        let rows: Vec<Vec<Value>> = if drawn.is_empty() {
            let mut visible = self.database.committed();
            visible.extend(self.pending().iter().cloned());
            visible
                .into_iter()
                .enumerate()
                .map(|(index, entry)| vec![Value::Integer(index as i64 + 1), Value::Text(entry)])
                .collect()
        } else {
            vec![drawn.into_iter().map(Value::Integer).collect()]
        };
        Arc::new(MemoryResultSet {
            session: self.clone(),
            rows: Mutex::new(rows),
            cursor: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn commit(&self) {
        let entries: Vec<String> = self.pending().drain(..).collect();
        self.database.commit_entries(entries);
        self.savepoints().clear();
    }
}

pub struct MemoryConnection {
    session: Arc<Session>,
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        self.session.check().await?;
        let was = self.session.auto_commit.swap(auto_commit, Ordering::SeqCst);
        if auto_commit && !was {
            self.session.commit();
        }
        Ok(())
    }

    async fn create_statement(&self) -> Result<Arc<dyn BackendStatement>> {
        self.session.check().await?;
        Ok(Arc::new(MemoryStatement::new(self.session.clone(), None)))
    }

    async fn prepare_statement(&self, sql: &str) -> Result<Arc<dyn BackendStatement>> {
        self.session.check().await?;
        Ok(Arc::new(MemoryStatement::new(
            self.session.clone(),
            Some(sql.to_string()),
        )))
    }

    async fn commit(&self) -> Result<()> {
        self.session.check().await?;
        self.session.commit();
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.session.check().await?;
        self.session.pending().clear();
        self.session.savepoints().clear();
        Ok(())
    }

    async fn set_savepoint(&self, name: &str) -> Result<Arc<dyn BackendSavepoint>> {
        self.session.check().await?;
        if self.session.auto_commit.load(Ordering::SeqCst) {
            return Err(DbError::ExecutionError(
                "savepoints require autocommit to be off".to_string(),
            ));
        }
        let mark = self.session.pending().len();
        self.session.savepoints().push((name.to_string(), mark));
        Ok(Arc::new(MemorySavepoint {
            name: name.to_string(),
        }))
    }

    async fn rollback_to_savepoint(&self, savepoint: Arc<dyn BackendSavepoint>) -> Result<()> {
        self.session.check().await?;
        let mut savepoints = self.session.savepoints();
        let position = find_savepoint(&savepoints, savepoint.name())?;
        let mark = savepoints[position].1;
        savepoints.truncate(position + 1);
        self.session.pending().truncate(mark);
        Ok(())
    }

    async fn release_savepoint(&self, savepoint: Arc<dyn BackendSavepoint>) -> Result<()> {
        self.session.check().await?;
        let mut savepoints = self.session.savepoints();
        let position = find_savepoint(&savepoints, savepoint.name())?;
        savepoints.truncate(position);
        Ok(())
    }

    async fn create_large_object(&self) -> Result<Arc<dyn BackendLargeObject>> {
        self.session.check().await?;
        Ok(Arc::new(MemoryLargeObject {
            database: self.session.database.clone(),
            data: Mutex::new(Vec::new()),
            freed: AtomicBool::new(false),
        }))
    }

    async fn server_version(&self) -> Result<String> {
        self.session.check().await?;
        Ok(format!("memory-{}", self.session.database.name()))
    }

    async fn close(&self) -> Result<()> {
        if !self.session.closed.swap(true, Ordering::SeqCst) {
            self.session.pending().clear();
            let mut state = self.session.database.state();
            state.connections = state.connections.saturating_sub(1);
        }
        Ok(())
    }
}

fn find_savepoint(savepoints: &[(String, usize)], name: &str) -> Result<usize> {
    savepoints
        .iter()
        .position(|(existing, _)| existing == name)
        .ok_or_else(|| DbError::ExecutionError(format!("Unknown savepoint '{}'", name)))
}

struct MemorySavepoint {
    name: String,
}

impl BackendSavepoint for MemorySavepoint {
    fn name(&self) -> &str {
        &self.name
    }
}

pub struct MemoryStatement {
    session: Arc<Session>,
    sql: Option<String>,
    parameters: Mutex<BTreeMap<usize, Value>>,
    batch: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MemoryStatement {
    fn new(session: Arc<Session>, sql: Option<String>) -> Self {
        Self {
            session,
            sql,
            parameters: Mutex::new(BTreeMap::new()),
            batch: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    async fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::Closed("statement".to_string()));
        }
        self.session.check().await
    }

    fn bind(&self, index: usize, value: Value) {
        self.parameters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, value);
    }

    /// Prepared SQL with its bound parameters rendered after it
    fn prepared(&self) -> Result<String> {
        let sql = self.sql.as_deref().ok_or_else(|| {
            DbError::UnsupportedOperation("statement was not prepared".to_string())
        })?;
        let parameters = self
            .parameters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if parameters.is_empty() {
            return Ok(sql.to_string());
        }
        let rendered: Vec<String> = parameters
            .iter()
            .map(|(index, value)| format!("{}={}", index, value))
            .collect();
        Ok(format!("{} [{}]", sql, rendered.join(", ")))
    }
}

#[async_trait]
impl BackendStatement for MemoryStatement {
    async fn execute_query(&self, sql: &str) -> Result<Arc<dyn BackendResultSet>> {
        self.check().await?;
        Ok(self.session.query(sql))
    }

    async fn execute_update(&self, sql: &str) -> Result<u64> {
        self.check().await?;
        Ok(self.session.write(sql))
    }

    async fn execute_insert(&self, sql: &str) -> Result<i64> {
        self.check().await?;
        self.session.write(sql);
        Ok(self.session.database.next_key())
    }

    async fn add_batch(&self, sql: &str) -> Result<()> {
        self.check().await?;
        self.batch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sql.to_string());
        Ok(())
    }

    async fn execute_batch(&self) -> Result<Vec<u64>> {
        self.check().await?;
        let batch: Vec<String> = self
            .batch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        Ok(batch.iter().map(|sql| self.session.write(sql)).collect())
    }

    async fn set_parameter(&self, index: usize, value: Value) -> Result<()> {
        self.check().await?;
        self.bind(index, value);
        Ok(())
    }

    async fn set_binary_stream(&self, index: usize, mut stream: ByteStream) -> Result<()> {
        self.check().await?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await?;
        self.bind(index, Value::Bytes(data));
        Ok(())
    }

    async fn set_character_stream(&self, index: usize, mut reader: CharStream) -> Result<()> {
        self.check().await?;
        let mut text = String::new();
        reader.read_to_string(&mut text).await?;
        self.bind(index, Value::Text(text));
        Ok(())
    }

    async fn set_large_object(
        &self,
        index: usize,
        object: Arc<dyn BackendLargeObject>,
    ) -> Result<()> {
        self.check().await?;
        let data = object.read_all().await?;
        self.bind(index, Value::Bytes(data));
        Ok(())
    }

    async fn execute_prepared_update(&self) -> Result<u64> {
        self.check().await?;
        let sql = self.prepared()?;
        Ok(self.session.write(&sql))
    }

    async fn execute_prepared_query(&self) -> Result<Arc<dyn BackendResultSet>> {
        self.check().await?;
        let sql = self.prepared()?;
        Ok(self.session.query(&sql))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MemoryResultSet {
    session: Arc<Session>,
    rows: Mutex<Vec<Vec<Value>>>,
    cursor: Mutex<Option<usize>>,
    closed: AtomicBool,
}

impl MemoryResultSet {
    async fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::Closed("result set".to_string()));
        }
        self.session.check().await
    }

    fn current(&self) -> Result<usize> {
        let cursor = *self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        match cursor {
            Some(row) if row < rows.len() => Ok(row),
            _ => Err(DbError::ExecutionError(
                "result set is not positioned on a row".to_string(),
            )),
        }
    }
}

#[async_trait]
impl BackendResultSet for MemoryResultSet {
    async fn next(&self) -> Result<bool> {
        self.check().await?;
        let len = self.rows.lock().unwrap_or_else(PoisonError::into_inner).len();
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let position = cursor.map_or(0, |row| (row + 1).min(len));
        *cursor = Some(position);
        Ok(position < len)
    }

    async fn get(&self, column: usize) -> Result<Value> {
        self.check().await?;
        let row = self.current()?;
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        rows[row].get(column).cloned().ok_or_else(|| {
            DbError::ExecutionError(format!("Column index {} out of range", column))
        })
    }

    async fn update(&self, column: usize, value: Value) -> Result<()> {
        self.check().await?;
        let row = self.current()?;
        {
            let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
            let cell = rows[row].get_mut(column).ok_or_else(|| {
                DbError::ExecutionError(format!("Column index {} out of range", column))
            })?;
            *cell = value.clone();
        }
        self.session
            .apply(format!("UPDATE ROW {} SET {} = {}", row + 1, column, value));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MemoryLargeObject {
    database: Arc<MemoryDatabase>,
    data: Mutex<Vec<u8>>,
    freed: AtomicBool,
}

impl MemoryLargeObject {
    async fn check(&self) -> Result<()> {
        if self.freed.load(Ordering::SeqCst) {
            return Err(DbError::Closed("large object".to_string()));
        }
        self.database.check().await
    }
}

#[async_trait]
impl BackendLargeObject for MemoryLargeObject {
    async fn write(&self, mut data: ByteStream) -> Result<u64> {
        self.check().await?;
        let mut buffer = Vec::new();
        data.read_to_end(&mut buffer).await?;
        let mut stored = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        stored.extend_from_slice(&buffer);
        Ok(stored.len() as u64)
    }

    async fn length(&self) -> Result<u64> {
        self.check().await?;
        Ok(self.data.lock().unwrap_or_else(PoisonError::into_inner).len() as u64)
    }

    async fn read_all(&self) -> Result<Vec<u8>> {
        self.check().await?;
        Ok(self.data.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn free(&self) -> Result<()> {
        if !self.freed.swap(true, Ordering::SeqCst) {
            self.data.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
        Ok(())
    }
}
