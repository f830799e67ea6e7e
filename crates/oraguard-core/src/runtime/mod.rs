//! Gateway dispatcher.
//!
//! Owns exactly one of each pipeline component and exposes the four
//! operations reserved for the tool-invocation layer:
//!
//! - `preview_query`: rate limit -> validate -> issue token
//! - `query_oracle`:  rate limit -> consume token -> re-validate ->
//!   circuit permit -> pool run -> circuit record
//! - `describe_table` / `list_tables`: rate limit -> identifier check ->
//!   circuit permit -> fixed metadata statement -> circuit record
//!
//! Every branch emits audit records in request order: ATTEMPT first, then
//! the outcome (with any circuit transition recorded in between).

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::{AuditEmitter, AuditKind, AuditRecord};
use crate::config::GatewayConfig;
use crate::db::identifier;
use crate::db::pool::{PoolConfig, PoolHealth, SessionPool};
use crate::db::session::{SessionFactory, TableData};
use crate::error::{GatewayError, Result};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitPhase, PhaseChange};
use crate::security::approval::ApprovalRegistry;
use crate::security::normalize::canonicalize;
use crate::security::rate_limit::SlidingWindowLimiter;
use crate::security::validator::{QueryValidator, QueryVerdict};
use crate::utils::{Clock, OsEntropy, SystemClock, TokenEntropy};

/// Longest sanitized driver message returned to callers.
const MAX_DRIVER_MESSAGE_CHARS: usize = 200;

/// Caller-facing view of a verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Whether the statement was admitted.
    pub admitted: bool,

    /// First rule that rejected the statement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Non-fatal observations.
    pub warnings: Vec<String>,

    /// Complexity score.
    pub complexity: u32,

    /// Row cap added by rewrite, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_row_cap: Option<u32>,
}

impl From<&QueryVerdict> for ValidationReport {
    fn from(verdict: &QueryVerdict) -> Self {
        Self {
            admitted:        verdict.admitted,
            reason:          verdict.reason.clone(),
            warnings:        verdict.warnings.clone(),
            complexity:      verdict.complexity,
            applied_row_cap: verdict.applied_row_cap,
        }
    }
}

/// Token handed back by a successful preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalGrant {
    /// One-shot token to present at execute.
    pub token: String,

    /// Seconds until the token expires.
    pub expires_in_seconds: u64,
}

/// `preview_query` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewResponse {
    /// The verdict, admitted or not.
    pub validation: ValidationReport,

    /// Present only when the statement was admitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalGrant>,
}

/// `query_oracle` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Always true on the success path; failures surface as errors.
    pub success: bool,

    /// Number of rows returned.
    pub row_count: usize,

    /// Rows as ordered column-to-value maps.
    pub rows: Vec<IndexMap<String, Value>>,

    /// The re-validation verdict.
    pub validation: ValidationReport,
}

/// One column from `describe_table`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// Declared data type.
    #[serde(rename = "type")]
    pub data_type: String,

    /// Whether the column accepts NULL.
    pub nullable: bool,

    /// Whether the column is part of the primary key.
    pub pk: bool,
}

/// `describe_table` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescribeResponse {
    /// Columns in declaration order.
    pub columns: Vec<ColumnInfo>,
}

/// `list_tables` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListTablesResponse {
    /// Table names in the requested schema.
    pub tables: Vec<String>,
}

/// The guarded query gateway.
///
/// One instance per process; all fields are safe to share across request
/// handlers behind an `Arc`.
pub struct Gateway {
    config:    GatewayConfig,
    validator: QueryValidator,
    limiter:   SlidingWindowLimiter,
    approvals: ApprovalRegistry,
    breaker:   CircuitBreaker,
    pool:      SessionPool,
    audit:     AuditEmitter,
    clock:     Arc<dyn Clock>,
}

impl Gateway {
    /// Connect with the system clock and OS entropy.
    pub async fn connect(
        config: GatewayConfig,
        factory: Arc<dyn SessionFactory>,
        audit: AuditEmitter,
    ) -> Result<Self> {
        Self::connect_with(config, factory, audit, Arc::new(SystemClock), Arc::new(OsEntropy))
            .await
    }

    /// Connect with explicit clock and entropy capabilities.
    pub async fn connect_with(
        config: GatewayConfig,
        factory: Arc<dyn SessionFactory>,
        audit: AuditEmitter,
        clock: Arc<dyn Clock>,
        entropy: Arc<dyn TokenEntropy>,
    ) -> Result<Self> {
        config.validate()?;

        let validator = QueryValidator::new(&config)?;
        let limiter =
            SlidingWindowLimiter::new(config.rate_max, config.rate_window_secs, Arc::clone(&clock));
        let approvals =
            ApprovalRegistry::new(config.approval_ttl_secs, Arc::clone(&clock), entropy);
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold:     config.failure_threshold,
                recovery_timeout_secs: config.recovery_timeout_secs,
                success_threshold:     config.success_threshold,
            },
            Arc::clone(&clock),
        );
        let pool =
            SessionPool::connect(PoolConfig::from_gateway(&config), factory, Arc::clone(&clock))
                .await?;

        Ok(Self {
            config,
            validator,
            limiter,
            approvals,
            breaker,
            pool,
            audit,
            clock,
        })
    }

    /// Validate a statement and, when admitted, issue a one-shot token.
    ///
    /// A rejected statement is a successful preview: the verdict is the
    /// payload. Only rate limiting surfaces as an error here.
    pub async fn preview_query(&self, sql: &str) -> Result<PreviewResponse> {
        const OP: &str = "preview_query";
        self.admit(OP).await?;

        let verdict = self.validator.validate(sql);
        if !verdict.admitted {
            self.audit
                .emit(
                    self.record(AuditKind::Block, OP)
                        .with_reason(verdict.reason.clone().unwrap_or_default()),
                )
                .await;
            return Ok(PreviewResponse {
                validation: ValidationReport::from(&verdict),
                approval:   None,
            });
        }

        let issued = self.approvals.issue(&verdict, &canonicalize(sql));
        self.audit
            .emit(
                self.record(AuditKind::ApprovalIssue, OP)
                    .with_token(&issued.token)
                    .with_complexity(verdict.complexity),
            )
            .await;

        Ok(PreviewResponse {
            validation: ValidationReport::from(&verdict),
            approval:   Some(ApprovalGrant {
                token:              issued.token,
                expires_in_seconds: issued.expires_in_seconds,
            }),
        })
    }

    /// Consume an approval token and execute the statement it previewed.
    pub async fn query_oracle(&self, sql: &str, approval_token: &str) -> Result<QueryResponse> {
        const OP: &str = "query_oracle";
        self.admit(OP).await?;

        if approval_token.trim().is_empty() {
            self.audit
                .emit(self.record(AuditKind::ApprovalReject, OP).with_reason("no token presented"))
                .await;
            return Err(GatewayError::ApprovalRequired);
        }

        if let Err(err) = self.approvals.consume(approval_token, sql) {
            self.audit
                .emit(
                    self.record(AuditKind::ApprovalReject, OP)
                        .with_token(approval_token)
                        .with_reason(err.to_string()),
                )
                .await;
            return Err(err);
        }
        self.audit
            .emit(self.record(AuditKind::ApprovalConsume, OP).with_token(approval_token))
            .await;

        // Defense in depth: validate again after consume so a token can
        // never launder a tampered statement past the rules.
        let verdict = self.validator.validate(sql);
        if !verdict.admitted {
            let reason = verdict.reason.clone().unwrap_or_default();
            self.audit.emit(self.record(AuditKind::Block, OP).with_reason(reason.clone())).await;
            return Err(GatewayError::validation(reason));
        }

        let (slot, data) = self.guarded_run(OP, &verdict.effective_sql, &[]).await?;

        let row_count = data.row_count();
        self.audit
            .emit(
                self.record(AuditKind::Success, OP)
                    .with_rows(row_count as u64)
                    .with_slot(slot)
                    .with_complexity(verdict.complexity),
            )
            .await;

        Ok(QueryResponse {
            success: true,
            row_count,
            rows: data.rows,
            validation: ValidationReport::from(&verdict),
        })
    }

    /// Column metadata for a whitelisted table name.
    ///
    /// No token is required because no free-form SQL is accepted: the name
    /// is identifier-checked and passed as a bind value into a fixed
    /// dictionary statement.
    pub async fn describe_table(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<DescribeResponse> {
        const OP: &str = "describe_table";
        self.admit(OP).await?;

        let (sql, binds) = match identifier::describe_statement(table, schema) {
            Ok(parts) => parts,
            Err(err) => {
                self.audit
                    .emit(self.record(AuditKind::Block, OP).with_reason(err.to_string()))
                    .await;
                return Err(err);
            },
        };

        let (slot, data) = self.guarded_run(OP, sql, &binds).await?;

        let columns: Vec<ColumnInfo> = data
            .rows
            .iter()
            .map(|row| ColumnInfo {
                name:      string_field(row, "COLUMN_NAME"),
                data_type: string_field(row, "DATA_TYPE"),
                nullable:  string_field(row, "NULLABLE") == "Y",
                pk:        string_field(row, "PK") == "Y",
            })
            .collect();

        self.audit
            .emit(
                self.record(AuditKind::Success, OP)
                    .with_rows(columns.len() as u64)
                    .with_slot(slot),
            )
            .await;

        Ok(DescribeResponse { columns })
    }

    /// Table names in the given (or current) schema.
    pub async fn list_tables(&self, schema: Option<&str>) -> Result<ListTablesResponse> {
        const OP: &str = "list_tables";
        self.admit(OP).await?;

        let (sql, binds) = match identifier::list_statement(schema) {
            Ok(parts) => parts,
            Err(err) => {
                self.audit
                    .emit(self.record(AuditKind::Block, OP).with_reason(err.to_string()))
                    .await;
                return Err(err);
            },
        };

        let (slot, data) = self.guarded_run(OP, sql, &binds).await?;

        let tables: Vec<String> =
            data.rows.iter().map(|row| string_field(row, "TABLE_NAME")).collect();

        self.audit
            .emit(
                self.record(AuditKind::Success, OP)
                    .with_rows(tables.len() as u64)
                    .with_slot(slot),
            )
            .await;

        Ok(ListTablesResponse { tables })
    }

    /// Aggregate pool health.
    #[must_use]
    pub fn pool_health(&self) -> PoolHealth {
        self.pool.health()
    }

    /// Current circuit phase.
    #[must_use]
    pub fn circuit_phase(&self) -> CircuitPhase {
        self.breaker.phase()
    }

    /// The configuration this gateway runs with.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Emit ATTEMPT and apply the shared rate limiter.
    async fn admit(&self, op: &str) -> Result<()> {
        self.audit.emit(self.record(AuditKind::Attempt, op)).await;
        if let Err(err) = self.limiter.check() {
            self.audit
                .emit(self.record(AuditKind::RateLimit, op).with_reason(err.to_string()))
                .await;
            return Err(err);
        }
        Ok(())
    }

    /// Run a statement behind the circuit breaker, recording the outcome.
    ///
    /// Acquire timeouts do not feed the breaker: the database was never
    /// called.
    async fn guarded_run(
        &self,
        op: &str,
        sql: &str,
        binds: &[String],
    ) -> Result<(usize, TableData)> {
        match self.breaker.permit() {
            Ok(Some(PhaseChange::HalfOpened)) => {
                self.audit
                    .emit(
                        self.record(AuditKind::CircuitHalfOpen, op)
                            .with_phase(CircuitPhase::HalfOpen.as_str()),
                    )
                    .await;
            },
            Ok(_) => {},
            Err(err) => {
                self.audit
                    .emit(
                        self.record(AuditKind::CircuitOpen, op)
                            .with_phase(CircuitPhase::Open.as_str())
                            .with_reason(err.to_string()),
                    )
                    .await;
                return Err(err);
            },
        }

        match self.pool.run(sql, binds).await {
            Ok(run) => {
                if self.breaker.record_success() == Some(PhaseChange::Closed) {
                    self.audit
                        .emit(
                            self.record(AuditKind::CircuitClose, op)
                                .with_phase(CircuitPhase::Closed.as_str()),
                        )
                        .await;
                }
                Ok(run)
            },
            Err(err) => {
                let pool_timeout = matches!(err, GatewayError::PoolTimeout { .. });
                if !pool_timeout
                    && self.breaker.record_failure() == Some(PhaseChange::Opened)
                {
                    self.audit
                        .emit(
                            self.record(AuditKind::CircuitOpen, op)
                                .with_phase(CircuitPhase::Open.as_str())
                                .with_reason("failure threshold reached"),
                        )
                        .await;
                }
                self.audit
                    .emit(self.record(AuditKind::Failure, op).with_reason(err.to_string()))
                    .await;
                Err(sanitize_driver(err))
            },
        }
    }

    fn record(&self, kind: AuditKind, op: &str) -> AuditRecord {
        AuditRecord::new(self.clock.now(), kind, op)
    }
}

/// Strip a driver error down to its first line, truncated. The full text
/// has already been recorded in the audit stream.
fn sanitize_driver(err: GatewayError) -> GatewayError {
    match err {
        GatewayError::Driver { message } => {
            let first_line = message.lines().next().unwrap_or("").trim();
            let sanitized: String = first_line.chars().take(MAX_DRIVER_MESSAGE_CHARS).collect();
            GatewayError::Driver {
                message: if sanitized.is_empty() {
                    "statement failed".to_string()
                } else {
                    sanitized
                },
            }
        },
        other => other,
    }
}

fn string_field(row: &IndexMap<String, Value>, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}
