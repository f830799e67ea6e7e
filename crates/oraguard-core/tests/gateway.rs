//! End-to-end gateway scenarios over a scripted driver.
//!
//! The driver is a queue of scripted behaviors shared by every session the
//! factory hands out; time and token entropy are deterministic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{json, Value};

use oraguard_core::audit::{AuditEmitter, AuditKind, AuditRecord, MemoryAuditSink};
use oraguard_core::db::{OracleSession, SessionFactory, StatementOptions, TableData};
use oraguard_core::resilience::CircuitPhase;
use oraguard_core::utils::{CountingEntropy, ManualClock};
use oraguard_core::{Gateway, GatewayConfig, GatewayError};

enum Step {
    Rows(TableData),
    Fail(&'static str),
    Stall(Duration),
}

#[derive(Default)]
struct DriverState {
    connects:   AtomicUsize,
    script:     Mutex<VecDeque<Step>>,
    statements: Mutex<Vec<String>>,
}

struct ScriptedSession {
    state: Arc<DriverState>,
}

#[async_trait]
impl OracleSession for ScriptedSession {
    async fn execute(
        &mut self,
        sql: &str,
        _binds: &[String],
        _opts: &StatementOptions,
    ) -> oraguard_core::Result<TableData> {
        self.state.statements.lock().push(sql.to_string());
        let step = self.state.script.lock().pop_front();
        match step {
            None => Ok(one_row()),
            Some(Step::Rows(data)) => Ok(data),
            Some(Step::Fail(message)) => Err(GatewayError::driver(message)),
            Some(Step::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(one_row())
            },
        }
    }

    async fn ping(&mut self) -> oraguard_core::Result<()> {
        Ok(())
    }
}

struct ScriptedFactory {
    state: Arc<DriverState>,
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn connect(&self) -> oraguard_core::Result<Box<dyn OracleSession>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            state: Arc::clone(&self.state),
        }))
    }
}

fn one_row() -> TableData {
    let mut row = IndexMap::new();
    row.insert("ID".to_string(), json!(1));
    TableData {
        columns: vec!["ID".to_string()],
        rows:    vec![row],
    }
}

fn table(columns: &[&str], rows: &[&[(&str, Value)]]) -> TableData {
    TableData {
        columns: columns.iter().map(ToString::to_string).collect(),
        rows:    rows
            .iter()
            .map(|pairs| {
                pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
            })
            .collect(),
    }
}

struct Harness {
    gateway: Gateway,
    clock:   ManualClock,
    state:   Arc<DriverState>,
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

async fn harness(config: GatewayConfig) -> Harness {
    let state = Arc::new(DriverState::default());
    let factory = Arc::new(ScriptedFactory {
        state: Arc::clone(&state),
    });

    let sink = MemoryAuditSink::default();
    let records = sink.records();
    let (emitter, _writer) = AuditEmitter::spawn(sink, 256);

    let clock = ManualClock::starting_now();
    let gateway = Gateway::connect_with(
        config,
        factory,
        emitter,
        Arc::new(clock.clone()),
        Arc::new(CountingEntropy::default()),
    )
    .await
    .unwrap();

    Harness {
        gateway,
        clock,
        state,
        records,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Preview an admitted statement and return its token.
async fn approved(h: &Harness, sql: &str) -> String {
    let preview = h.gateway.preview_query(sql).await.unwrap();
    assert!(preview.validation.admitted, "expected admission for {sql}");
    preview.approval.unwrap().token
}

#[tokio::test]
async fn test_comment_evasion_is_neutralized() {
    let h = harness(GatewayConfig::default()).await;

    let preview = h.gateway.preview_query("SEL/**/ECT * FROM DUAL").await.unwrap();
    assert!(preview.validation.admitted);
    assert_eq!(preview.validation.complexity, 5);
    assert_eq!(preview.validation.applied_row_cap, Some(10_000));
}

#[tokio::test]
async fn test_case_evasion_is_blocked() {
    let h = harness(GatewayConfig::default()).await;

    let preview = h.gateway.preview_query("dElEtE FROM T").await.unwrap();
    assert!(!preview.validation.admitted);
    assert!(preview.validation.reason.unwrap().contains("DELETE"));
    assert!(preview.approval.is_none());
}

#[tokio::test]
async fn test_suffix_false_positive_is_admitted() {
    let h = harness(GatewayConfig::default()).await;

    let preview = h.gateway.preview_query("SELECT UPDATED_AT FROM ORDERS").await.unwrap();
    assert!(preview.validation.admitted);
}

#[tokio::test]
async fn test_implicit_cartesian_is_blocked() {
    let h = harness(GatewayConfig::default()).await;

    let preview = h.gateway.preview_query("SELECT * FROM A, B").await.unwrap();
    assert!(!preview.validation.admitted);
    assert!(preview.validation.reason.unwrap().contains("cartesian"));
}

#[tokio::test]
async fn test_preview_execute_happy_path_and_one_shot_token() {
    let h = harness(GatewayConfig::default()).await;

    let token = approved(&h, "SELECT id FROM USERS").await;
    let result = h.gateway.query_oracle("SELECT id FROM USERS", &token).await.unwrap();
    assert!(result.success);
    assert_eq!(result.row_count, 1);
    assert_eq!(result.validation.complexity, 5);

    // The driver saw the row-capped rewrite, not the raw text.
    let statements = h.state.statements.lock().clone();
    assert_eq!(statements.len(), 1);
    assert!(statements[0].contains("ROWNUM <= 10000"));
    assert!(statements[0].contains("SELECT id FROM USERS"));

    // Same token again: consumed.
    let err = h.gateway.query_oracle("SELECT id FROM USERS", &token).await.unwrap_err();
    assert_eq!(err.error_code(), "approval_invalid");
}

#[tokio::test]
async fn test_token_bound_to_canonical_statement() {
    let h = harness(GatewayConfig::default()).await;

    let token = approved(&h, "SELECT 1 FROM DUAL").await;
    let err = h.gateway.query_oracle("SELECT 2 FROM DUAL", &token).await.unwrap_err();
    assert_eq!(err.error_code(), "approval_mismatch");

    // Canonically equal text still consumes.
    let result = h.gateway.query_oracle("select /* ok */ 1\n FROM dual", &token).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_execute_without_token_is_rejected() {
    let h = harness(GatewayConfig::default()).await;

    let err = h.gateway.query_oracle("SELECT 1 FROM DUAL", "").await.unwrap_err();
    assert_eq!(err.error_code(), "approval_required");
    assert!(h.state.statements.lock().is_empty());
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    let h = harness(GatewayConfig::default()).await;

    let token = approved(&h, "SELECT 1 FROM DUAL").await;
    h.clock.advance_secs(301);

    let err = h.gateway.query_oracle("SELECT 1 FROM DUAL", &token).await.unwrap_err();
    assert_eq!(err.error_code(), "approval_expired");
}

#[tokio::test]
async fn test_circuit_opens_after_consecutive_failures_then_recovers() {
    let h = harness(GatewayConfig::default()).await;
    {
        let mut script = h.state.script.lock();
        for _ in 0..5 {
            script.push_back(Step::Fail("ORA-03113: end-of-file on communication channel"));
        }
    }

    for i in 0..5 {
        let token = approved(&h, &format!("SELECT {i} FROM DUAL")).await;
        let err = h.gateway.query_oracle(&format!("SELECT {i} FROM DUAL"), &token).await;
        assert_eq!(err.unwrap_err().error_code(), "driver_error", "call {i}");
    }
    assert_eq!(h.gateway.circuit_phase(), CircuitPhase::Open);

    // Sixth call is refused without touching the pool.
    let before = h.state.statements.lock().len();
    let token = approved(&h, "SELECT 6 FROM DUAL").await;
    let err = h.gateway.query_oracle("SELECT 6 FROM DUAL", &token).await.unwrap_err();
    assert_eq!(err.error_code(), "circuit_open");
    assert_eq!(err.retry_after(), Some(60));
    assert_eq!(h.state.statements.lock().len(), before);

    // After the cool-down the next call is admitted as a probe.
    h.clock.advance_secs(60);
    let token = approved(&h, "SELECT 7 FROM DUAL").await;
    let result = h.gateway.query_oracle("SELECT 7 FROM DUAL", &token).await;
    assert!(result.is_ok());
    assert_eq!(h.gateway.circuit_phase(), CircuitPhase::HalfOpen);

    // A second probe success closes the circuit.
    let token = approved(&h, "SELECT 8 FROM DUAL").await;
    h.gateway.query_oracle("SELECT 8 FROM DUAL", &token).await.unwrap();
    assert_eq!(h.gateway.circuit_phase(), CircuitPhase::Closed);
}

#[tokio::test]
async fn test_pool_saturation_times_out_third_caller() {
    let config = GatewayConfig {
        pool_size: 2,
        acquire_timeout_secs: 1,
        ..GatewayConfig::default()
    };
    let h = harness(config).await;
    {
        let mut script = h.state.script.lock();
        script.push_back(Step::Stall(Duration::from_secs(2)));
        script.push_back(Step::Stall(Duration::from_secs(2)));
    }

    let t1 = approved(&h, "SELECT 1 FROM DUAL").await;
    let t2 = approved(&h, "SELECT 2 FROM DUAL").await;
    let t3 = approved(&h, "SELECT 3 FROM DUAL").await;

    let (r1, r2, r3) = tokio::join!(
        h.gateway.query_oracle("SELECT 1 FROM DUAL", &t1),
        h.gateway.query_oracle("SELECT 2 FROM DUAL", &t2),
        h.gateway.query_oracle("SELECT 3 FROM DUAL", &t3),
    );

    let outcomes = [r1, r2, r3];
    let failures: Vec<&GatewayError> =
        outcomes.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 2);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].error_code(), "pool_timeout");
}

#[tokio::test]
async fn test_broken_slot_recovers_transparently() {
    let config = GatewayConfig {
        pool_size: 1,
        ..GatewayConfig::default()
    };
    let h = harness(config).await;
    h.state.script.lock().push_back(Step::Fail("ORA-03135: connection lost contact"));

    let token = approved(&h, "SELECT 1 FROM DUAL").await;
    let err = h.gateway.query_oracle("SELECT 1 FROM DUAL", &token).await.unwrap_err();
    assert_eq!(err.error_code(), "driver_error");

    wait_until(|| h.gateway.pool_health().all_healthy).await;
    assert_eq!(h.state.connects.load(Ordering::SeqCst), 2);

    let token = approved(&h, "SELECT 2 FROM DUAL").await;
    let result = h.gateway.query_oracle("SELECT 2 FROM DUAL", &token).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_driver_errors_are_sanitized_for_callers() {
    let h = harness(GatewayConfig::default()).await;
    h.state
        .script
        .lock()
        .push_back(Step::Fail("ORA-00904: invalid identifier\n  at /u01/app/oracle/..."));

    let token = approved(&h, "SELECT nope FROM DUAL").await;
    let err = h.gateway.query_oracle("SELECT nope FROM DUAL", &token).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("ORA-00904"));
    assert!(!message.contains("/u01/app/oracle"));
}

#[tokio::test]
async fn test_existing_row_bound_is_not_rewritten() {
    let h = harness(GatewayConfig::default()).await;

    let sql = "SELECT * FROM t WHERE ROWNUM <= 5";
    let token = approved(&h, sql).await;
    h.gateway.query_oracle(sql, &token).await.unwrap();

    let statements = h.state.statements.lock().clone();
    assert_eq!(statements[0], sql);
}

#[tokio::test]
async fn test_describe_table_maps_dictionary_rows() {
    let h = harness(GatewayConfig::default()).await;
    h.state.script.lock().push_back(Step::Rows(table(
        &["COLUMN_NAME", "DATA_TYPE", "NULLABLE", "PK"],
        &[
            &[
                ("COLUMN_NAME", json!("ID")),
                ("DATA_TYPE", json!("NUMBER")),
                ("NULLABLE", json!("N")),
                ("PK", json!("Y")),
            ],
            &[
                ("COLUMN_NAME", json!("NAME")),
                ("DATA_TYPE", json!("VARCHAR2")),
                ("NULLABLE", json!("Y")),
                ("PK", json!("N")),
            ],
        ],
    )));

    let described = h.gateway.describe_table("orders", Some("app")).await.unwrap();
    assert_eq!(described.columns.len(), 2);
    assert_eq!(described.columns[0].name, "ID");
    assert!(described.columns[0].pk);
    assert!(!described.columns[0].nullable);
    assert_eq!(described.columns[1].data_type, "VARCHAR2");

    let statements = h.state.statements.lock().clone();
    assert!(statements[0].contains("ALL_TAB_COLUMNS"));
    // Caller names travel as binds, never interpolated.
    assert!(!statements[0].contains("ORDERS"));
}

#[tokio::test]
async fn test_describe_table_rejects_bad_identifier_before_any_db_call() {
    let h = harness(GatewayConfig::default()).await;

    let err = h.gateway.describe_table("BAD-NAME", None).await.unwrap_err();
    assert_eq!(err.error_code(), "bad_identifier");
    assert!(h.state.statements.lock().is_empty());
}

#[tokio::test]
async fn test_list_tables_returns_names() {
    let h = harness(GatewayConfig::default()).await;
    h.state.script.lock().push_back(Step::Rows(table(
        &["TABLE_NAME"],
        &[
            &[("TABLE_NAME", json!("ORDERS"))],
            &[("TABLE_NAME", json!("USERS"))],
        ],
    )));

    let listed = h.gateway.list_tables(Some("app")).await.unwrap();
    assert_eq!(listed.tables, vec!["ORDERS".to_string(), "USERS".to_string()]);
}

#[tokio::test]
async fn test_list_tables_rejects_bad_schema() {
    let h = harness(GatewayConfig::default()).await;

    let err = h.gateway.list_tables(Some("x; drop")).await.unwrap_err();
    assert_eq!(err.error_code(), "bad_identifier");
}

#[tokio::test]
async fn test_rate_limiter_guards_all_operations() {
    let config = GatewayConfig {
        rate_max: 2,
        ..GatewayConfig::default()
    };
    let h = harness(config).await;

    h.gateway.preview_query("SELECT 1 FROM DUAL").await.unwrap();
    h.gateway.list_tables(None).await.unwrap();

    // The shared window is full; a third request of any kind is refused.
    let err = h.gateway.preview_query("SELECT 2 FROM DUAL").await.unwrap_err();
    assert_eq!(err.error_code(), "rate_limited");
    assert!(err.retry_after().is_some());
}

#[tokio::test]
async fn test_audit_order_for_preview_and_execute() {
    let h = harness(GatewayConfig::default()).await;

    let token = approved(&h, "SELECT id FROM USERS").await;
    h.gateway.query_oracle("SELECT id FROM USERS", &token).await.unwrap();

    wait_until(|| h.records.lock().len() >= 5).await;
    let records = h.records.lock().clone();

    let preview_kinds: Vec<AuditKind> =
        records.iter().filter(|r| r.op == "preview_query").map(|r| r.kind).collect();
    assert_eq!(preview_kinds, vec![AuditKind::Attempt, AuditKind::ApprovalIssue]);

    let execute_kinds: Vec<AuditKind> =
        records.iter().filter(|r| r.op == "query_oracle").map(|r| r.kind).collect();
    assert_eq!(
        execute_kinds,
        vec![AuditKind::Attempt, AuditKind::ApprovalConsume, AuditKind::Success]
    );

    let success = records
        .iter()
        .find(|r| r.kind == AuditKind::Success)
        .expect("success record");
    assert_eq!(success.rows, Some(1));
    assert!(success.slot.is_some());
    assert_eq!(success.complexity, Some(5));

    // Token ids are truncated in the stream.
    let issue = records
        .iter()
        .find(|r| r.kind == AuditKind::ApprovalIssue)
        .expect("issue record");
    assert_eq!(issue.token_id.as_ref().map(String::len), Some(8));
}

#[tokio::test]
async fn test_audit_records_circuit_transitions() {
    let h = harness(GatewayConfig::default()).await;
    {
        let mut script = h.state.script.lock();
        for _ in 0..5 {
            script.push_back(Step::Fail("ORA-03113: end-of-file on communication channel"));
        }
    }

    for i in 0..5 {
        let token = approved(&h, &format!("SELECT {i} FROM DUAL")).await;
        let _ = h.gateway.query_oracle(&format!("SELECT {i} FROM DUAL"), &token).await;
    }

    wait_until(|| {
        h.records.lock().iter().any(|r| r.kind == AuditKind::CircuitOpen)
    })
    .await;
    let records = h.records.lock().clone();
    let open = records
        .iter()
        .find(|r| r.kind == AuditKind::CircuitOpen)
        .expect("circuit-open record");
    assert_eq!(open.phase.as_deref(), Some("OPEN"));
}
