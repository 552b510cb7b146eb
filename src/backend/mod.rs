//! Driver-facing traits implemented once per physical backend.
//!
//! The cluster layer never talks to a database directly: every real object it
//! proxies (data source, connection, statement, ...) is one of these trait
//! objects, created by the backend for one replica.

pub mod memory;

use crate::core::{Result, Value};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncRead};

/// Single-use binary parameter source
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Single-use character parameter source
pub type CharStream = Box<dyn AsyncBufRead + Send + Unpin>;

/// Connection factory for one replica
#[async_trait]
pub trait BackendDataSource: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BackendConnection>>;
}

#[async_trait]
pub trait BackendConnection: Send + Sync {
    async fn set_auto_commit(&self, auto_commit: bool) -> Result<()>;

    async fn create_statement(&self) -> Result<Arc<dyn BackendStatement>>;

    async fn prepare_statement(&self, sql: &str) -> Result<Arc<dyn BackendStatement>>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn set_savepoint(&self, name: &str) -> Result<Arc<dyn BackendSavepoint>>;

    async fn rollback_to_savepoint(&self, savepoint: Arc<dyn BackendSavepoint>) -> Result<()>;

    async fn release_savepoint(&self, savepoint: Arc<dyn BackendSavepoint>) -> Result<()>;

    async fn create_large_object(&self) -> Result<Arc<dyn BackendLargeObject>>;

    async fn server_version(&self) -> Result<String>;

    async fn close(&self) -> Result<()>;
}

/// Plain or prepared statement. Prepared statements carry their SQL from
/// `prepare_statement` and use the `*_prepared_*` calls.
#[async_trait]
pub trait BackendStatement: Send + Sync {
    async fn execute_query(&self, sql: &str) -> Result<Arc<dyn BackendResultSet>>;

    /// Rows affected
    async fn execute_update(&self, sql: &str) -> Result<u64>;

    /// Execute an insert and return the generated key
    async fn execute_insert(&self, sql: &str) -> Result<i64>;

    async fn add_batch(&self, sql: &str) -> Result<()>;

    async fn execute_batch(&self) -> Result<Vec<u64>>;

    async fn set_parameter(&self, index: usize, value: Value) -> Result<()>;

    async fn set_binary_stream(&self, index: usize, stream: ByteStream) -> Result<()>;

    async fn set_character_stream(&self, index: usize, reader: CharStream) -> Result<()>;

    async fn set_large_object(&self, index: usize, object: Arc<dyn BackendLargeObject>)
    -> Result<()>;

    async fn execute_prepared_update(&self) -> Result<u64>;

    async fn execute_prepared_query(&self) -> Result<Arc<dyn BackendResultSet>>;

    async fn close(&self) -> Result<()>;
}

/// Forward-only cursor. Columns are 0-based.
#[async_trait]
pub trait BackendResultSet: Send + Sync {
    async fn next(&self) -> Result<bool>;

    async fn get(&self, column: usize) -> Result<Value>;

    async fn update(&self, column: usize, value: Value) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

pub trait BackendSavepoint: Send + Sync {
    fn name(&self) -> &str;
}

#[async_trait]
pub trait BackendLargeObject: Send + Sync {
    /// Append the stream's contents, returning the new length
    async fn write(&self, data: ByteStream) -> Result<u64>;

    async fn length(&self) -> Result<u64>;

    async fn read_all(&self) -> Result<Vec<u8>>;

    async fn free(&self) -> Result<()>;
}
