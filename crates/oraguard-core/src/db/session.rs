//! Opaque driver seam.
//!
//! The gateway never speaks the wire protocol itself: it hands SQL text and
//! bind values to an [`OracleSession`] and gets tabular rows or an error
//! back. A [`SessionFactory`] knows how to establish new sessions; the pool
//! uses it at startup and whenever a slot must be re-established.

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Per-statement execution options.
#[derive(Debug, Clone)]
pub struct StatementOptions {
    /// Server-side statement timeout.
    pub query_timeout: Duration,

    /// Rows fetched per round trip, bounding transfer size before the row
    /// cap applies.
    pub fetch_chunk: u32,
}

/// Tabular result: columns as declared by the result metadata, rows as
/// ordered maps of column name to value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableData {
    /// Column names in declaration order.
    pub columns: Vec<String>,

    /// Row values keyed by column name, in column order.
    pub rows: Vec<IndexMap<String, Value>>,
}

impl TableData {
    /// Number of rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// One long-lived database session.
///
/// Implementations are not expected to be thread-safe; the pool serializes
/// use per slot.
#[async_trait]
pub trait OracleSession: Send {
    /// Run one statement and return its rows.
    ///
    /// `binds` are positional (`:1`, `:2`, ...). The implementation must
    /// honor `opts.query_timeout` server-side and `opts.fetch_chunk` for
    /// result transfer.
    async fn execute(
        &mut self,
        sql: &str,
        binds: &[String],
        opts: &StatementOptions,
    ) -> Result<TableData>;

    /// Health probe (a `SELECT 1 FROM DUAL`-shaped round trip).
    async fn ping(&mut self) -> Result<()>;
}

/// Establishes new database sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a fresh session.
    async fn connect(&self) -> Result<Box<dyn OracleSession>>;
}
