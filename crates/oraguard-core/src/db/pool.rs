//! Slot-based session pool.
//!
//! Owns N long-lived sessions, one serial queue per slot: at most one
//! statement is in flight per session at any instant. Callers wait FIFO for
//! an idle slot (the semaphore is fair, and a cancelled waiter releases its
//! queue position); selection over idle slots is round-robin. A slot that
//! sees a transport or protocol error goes Broken and is re-established out
//! of band - it returns to rotation only after a health probe succeeds.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Semaphore};

use crate::config::GatewayConfig;
use crate::db::session::{OracleSession, SessionFactory, StatementOptions, TableData};
use crate::error::{GatewayError, Result};
use crate::utils::Clock;

/// Pool sizing and timeout parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of slots.
    pub size: usize,

    /// How long a caller may wait for an idle slot.
    pub acquire_timeout: Duration,

    /// Per-statement timeout, applied server- and client-side.
    pub query_timeout: Duration,

    /// Fetch chunk configured on every statement.
    pub fetch_chunk: u32,
}

impl PoolConfig {
    /// Derive the pool parameters from the gateway configuration.
    #[must_use]
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            size:            config.pool_size,
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
            query_timeout:   Duration::from_secs(config.query_timeout_secs),
            fetch_chunk:     config.fetch_chunk,
        }
    }
}

/// Lifecycle state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotState {
    /// Available for the next statement.
    Idle,
    /// A statement is in flight.
    Busy,
    /// The session died; re-establishment is in progress.
    Broken,
}

#[derive(Debug, Clone)]
struct SlotStatus {
    state:       SlotState,
    last_ok_at:  Option<DateTime<Utc>>,
    owner_epoch: u64,
}

/// Aggregate pool health.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    /// Total slots.
    pub total: usize,
    /// Slots not currently Broken.
    pub healthy: usize,
    /// Broken slots.
    pub unhealthy: usize,
    /// Whether every slot is healthy.
    pub all_healthy: bool,
}

struct PoolInner {
    config:   PoolConfig,
    factory:  Arc<dyn SessionFactory>,
    clock:    Arc<dyn Clock>,
    sessions: Vec<Mutex<Option<Box<dyn OracleSession>>>>,
    status:   Mutex<Vec<SlotStatus>>,
    idle:     Mutex<VecDeque<usize>>,
    permits:  Semaphore,
}

/// Fixed-size pool of long-lived database sessions.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Connect all slots eagerly. Any failure here is fatal: a gateway that
    /// cannot reach its database at startup should not come up.
    pub async fn connect(
        config: PoolConfig,
        factory: Arc<dyn SessionFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut sessions = Vec::with_capacity(config.size);
        let mut status = Vec::with_capacity(config.size);
        let now = clock.now();

        for _ in 0..config.size {
            let mut session = factory.connect().await?;
            session.ping().await?;
            sessions.push(Mutex::new(Some(session)));
            status.push(SlotStatus {
                state:       SlotState::Idle,
                last_ok_at:  Some(now),
                owner_epoch: 0,
            });
        }

        let size = config.size;
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                clock,
                sessions,
                status: Mutex::new(status),
                idle: Mutex::new((0..size).collect()),
                permits: Semaphore::new(size),
            }),
        })
    }

    /// Run one statement on the next idle slot.
    ///
    /// The wait for a slot is cancellable and releases its queue position
    /// when abandoned. Once a slot is taken, the statement runs in a task
    /// owned by the pool: a caller that abandons this call does not cancel
    /// the wire protocol, and the slot returns to rotation only when the
    /// statement resolves (result, error, or statement timeout).
    ///
    /// Returns the slot index alongside the rows so the caller can audit
    /// which session did the work.
    ///
    /// # Errors
    ///
    /// - `PoolTimeout` when no slot frees up within the acquire window
    /// - `Driver` on execution failure or when the hard client-side timeout
    ///   fires (the slot goes Broken in both cases)
    pub async fn run(&self, sql: &str, binds: &[String]) -> Result<(usize, TableData)> {
        let inner = &self.inner;

        let permit =
            match tokio::time::timeout(inner.config.acquire_timeout, inner.permits.acquire()).await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(GatewayError::internal("session pool closed")),
                Err(_) => {
                    return Err(GatewayError::PoolTimeout {
                        waited_ms: u64::try_from(inner.config.acquire_timeout.as_millis())
                            .unwrap_or(u64::MAX),
                    });
                },
            };
        // The permit is re-created by return_idle / reestablish, not by
        // dropping this guard.
        permit.forget();

        let index = inner
            .idle
            .lock()
            .pop_front()
            .ok_or_else(|| GatewayError::internal("idle queue out of sync with permits"))?;

        let session = inner.sessions[index]
            .lock()
            .take()
            .ok_or_else(|| GatewayError::internal("idle slot had no session"))?;
        inner.set_state(index, SlotState::Busy);

        let mut lease = SlotLease {
            inner:   Arc::clone(inner),
            index,
            session: Some(session),
        };

        let opts = StatementOptions {
            query_timeout: inner.config.query_timeout,
            fetch_chunk:   inner.config.fetch_chunk,
        };
        let query_timeout = inner.config.query_timeout;
        let sql = sql.to_string();
        let binds = binds.to_vec();

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(
                query_timeout,
                lease.execute(&sql, &binds, &opts),
            )
            .await
            {
                Ok(Ok(data)) => {
                    lease.release_ok();
                    Ok((index, data))
                },
                Ok(Err(err)) => {
                    lease.release_broken();
                    Err(err)
                },
                Err(_) => {
                    lease.release_broken();
                    Err(GatewayError::driver(format!(
                        "statement exceeded the {}ms client-side timeout",
                        query_timeout.as_millis()
                    )))
                },
            };
            // An abandoned caller has dropped the receiver; the slot was
            // already released above either way.
            let _ = done_tx.send(outcome);
        });

        match done_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(GatewayError::internal("statement task terminated without a result")),
        }
    }

    /// Aggregate health view.
    #[must_use]
    pub fn health(&self) -> PoolHealth {
        let status = self.inner.status.lock();
        let total = status.len();
        let healthy = status.iter().filter(|s| s.state != SlotState::Broken).count();
        PoolHealth {
            total,
            healthy,
            unhealthy: total - healthy,
            all_healthy: healthy == total,
        }
    }

    /// How many times a slot's session has been re-established.
    #[must_use]
    pub fn slot_epoch(&self, index: usize) -> Option<u64> {
        self.inner.status.lock().get(index).map(|s| s.owner_epoch)
    }
}

impl PoolInner {
    fn set_state(&self, index: usize, state: SlotState) {
        let mut status = self.status.lock();
        if let Some(slot) = status.get_mut(index) {
            slot.state = state;
        }
    }

    fn return_idle(&self, index: usize, session: Box<dyn OracleSession>) {
        *self.sessions[index].lock() = Some(session);
        {
            let mut status = self.status.lock();
            if let Some(slot) = status.get_mut(index) {
                slot.state = SlotState::Idle;
                slot.last_ok_at = Some(self.clock.now());
            }
        }
        self.idle.lock().push_back(index);
        self.permits.add_permits(1);
    }

    fn schedule_reestablish(inner: &Arc<Self>, index: usize) {
        inner.set_state(index, SlotState::Broken);
        tracing::warn!(slot = index, "database session broken, re-establishing out of band");

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            inner.reestablish(index).await;
        });
    }

    async fn reestablish(&self, index: usize) {
        let mut backoff = Duration::from_millis(100);
        loop {
            match self.factory.connect().await {
                Ok(mut session) => match session.ping().await {
                    Ok(()) => {
                        *self.sessions[index].lock() = Some(session);
                        {
                            let mut status = self.status.lock();
                            if let Some(slot) = status.get_mut(index) {
                                slot.state = SlotState::Idle;
                                slot.last_ok_at = Some(self.clock.now());
                                slot.owner_epoch += 1;
                            }
                        }
                        self.idle.lock().push_back(index);
                        self.permits.add_permits(1);
                        tracing::info!(slot = index, "database session re-established");
                        return;
                    },
                    Err(err) => {
                        tracing::warn!(slot = index, error = %err, "health probe failed");
                    },
                },
                Err(err) => {
                    tracing::warn!(slot = index, error = %err, "reconnect attempt failed");
                },
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    }
}

/// Exclusive use of one slot's session for one statement.
struct SlotLease {
    inner:   Arc<PoolInner>,
    index:   usize,
    session: Option<Box<dyn OracleSession>>,
}

impl SlotLease {
    async fn execute(
        &mut self,
        sql: &str,
        binds: &[String],
        opts: &StatementOptions,
    ) -> Result<TableData> {
        match self.session.as_mut() {
            Some(session) => session.execute(sql, binds, opts).await,
            None => Err(GatewayError::internal("slot lease has no session")),
        }
    }

    fn release_ok(mut self) {
        if let Some(session) = self.session.take() {
            self.inner.return_idle(self.index, session);
        }
    }

    fn release_broken(mut self) {
        self.session.take();
        PoolInner::schedule_reestablish(&self.inner, self.index);
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        // The release paths take the session out first; one still present
        // here means the statement task unwound without resolving the slot.
        if let Some(session) = self.session.take() {
            self.inner.return_idle(self.index, session);
        }
    }
}
