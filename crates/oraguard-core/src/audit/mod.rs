//! Structured audit records and the append-only emitter.
//!
//! Components produce [`AuditRecord`] values and hand them to the emitter;
//! nothing in the pipeline writes free-form log lines for business events.
//! The emitter is buffered so database calls never block on the sink, but
//! the buffer is bounded and `emit` awaits space when it is full: records
//! are back-pressured, never dropped or coalesced.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{GatewayError, Result};

/// Lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    /// A request entered the pipeline.
    Attempt,
    /// The validator or identifier check refused the request.
    Block,
    /// The statement ran and rows came back.
    Success,
    /// The database call failed.
    Failure,
    /// A preview issued a token.
    ApprovalIssue,
    /// An execute consumed its token.
    ApprovalConsume,
    /// A token was rejected (missing, unknown, expired, or mismatched).
    ApprovalReject,
    /// The rate limiter refused the request.
    RateLimit,
    /// The circuit opened, or refused a call while open.
    CircuitOpen,
    /// The circuit closed after successful probes.
    CircuitClose,
    /// The circuit admitted a probe after its cool-down.
    CircuitHalfOpen,
}

impl AuditKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Attempt => "ATTEMPT",
            Self::Block => "BLOCK",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::ApprovalIssue => "APPROVAL_ISSUE",
            Self::ApprovalConsume => "APPROVAL_CONSUME",
            Self::ApprovalReject => "APPROVAL_REJECT",
            Self::RateLimit => "RATE_LIMIT",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::CircuitClose => "CIRCUIT_CLOSE",
            Self::CircuitHalfOpen => "CIRCUIT_HALF_OPEN",
        }
    }
}

/// How many hex characters of a token id reach the audit stream.
const TOKEN_ID_AUDIT_CHARS: usize = 8;

/// One append-only audit record. Serialized as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// RFC-3339 timestamp with millisecond precision.
    pub ts: String,

    /// Event kind.
    pub kind: AuditKind,

    /// Operation the event belongs to.
    pub op: String,

    /// Human-readable reason, for rejections and failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Complexity score of the statement involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity: Option<u32>,

    /// Rows returned by a successful execute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,

    /// Truncated approval token id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,

    /// Slot that ran the statement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<usize>,

    /// Circuit phase, for circuit events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl AuditRecord {
    /// Create a record stamped at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>, kind: AuditKind, op: impl Into<String>) -> Self {
        Self {
            ts: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            kind,
            op: op.into(),
            reason: None,
            complexity: None,
            rows: None,
            token_id: None,
            slot: None,
            phase: None,
        }
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach a complexity score.
    #[must_use]
    pub fn with_complexity(mut self, complexity: u32) -> Self {
        self.complexity = Some(complexity);
        self
    }

    /// Attach a row count.
    #[must_use]
    pub fn with_rows(mut self, rows: u64) -> Self {
        self.rows = Some(rows);
        self
    }

    /// Attach a token id, truncated so the full credential never lands in
    /// the audit stream.
    #[must_use]
    pub fn with_token(mut self, token: &str) -> Self {
        self.token_id = Some(token.chars().take(TOKEN_ID_AUDIT_CHARS).collect());
        self
    }

    /// Attach the slot that ran the statement.
    #[must_use]
    pub fn with_slot(mut self, slot: usize) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Attach the circuit phase.
    #[must_use]
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }
}

/// Destination for audit records.
#[async_trait::async_trait]
pub trait AuditSink: Send + 'static {
    /// Append one record.
    async fn append(&mut self, record: &AuditRecord) -> Result<()>;
}

/// Buffered, order-preserving emitter in front of a sink.
#[derive(Clone)]
pub struct AuditEmitter {
    tx: mpsc::Sender<AuditRecord>,
}

impl AuditEmitter {
    /// Spawn the writer task for `sink` and return the emitter plus the
    /// task handle.
    #[must_use]
    pub fn spawn(mut sink: impl AuditSink, buffer: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(buffer.max(1));
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(err) = sink.append(&record).await {
                    tracing::error!(error = %err, kind = record.kind.as_str(), "audit sink write failed");
                }
            }
        });
        (Self { tx }, handle)
    }

    /// Emit one record, awaiting buffer space if the sink is behind.
    pub async fn emit(&self, record: AuditRecord) {
        if self.tx.send(record).await.is_err() {
            tracing::error!("audit channel closed; record could not be delivered");
        }
    }
}

/// JSON-lines file sink.
pub struct FileAuditSink {
    file: tokio::fs::File,
}

impl FileAuditSink {
    /// Open (or create) the audit log in append mode.
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await
            .map_err(|e| GatewayError::internal(format!("failed to open audit log: {e}")))?;
        Ok(Self { file })
    }
}

#[async_trait::async_trait]
impl AuditSink for FileAuditSink {
    async fn append(&mut self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| GatewayError::internal(format!("audit serialization failed: {e}")))?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| GatewayError::internal(format!("audit write failed: {e}")))?;
        self.file
            .flush()
            .await
            .map_err(|e| GatewayError::internal(format!("audit flush failed: {e}")))?;
        Ok(())
    }
}

/// In-memory sink for tests and embedded introspection.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: std::sync::Arc<parking_lot::Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditSink {
    /// Shared handle to the collected records.
    #[must_use]
    pub fn records(&self) -> std::sync::Arc<parking_lot::Mutex<Vec<AuditRecord>>> {
        std::sync::Arc::clone(&self.records)
    }
}

#[async_trait::async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&mut self, record: &AuditRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}
