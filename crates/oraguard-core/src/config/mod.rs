//! Gateway configuration.
//!
//! Two structs: [`GatewayConfig`] carries the admission and pool tunables
//! with their documented defaults, [`DatabaseSettings`] carries the
//! connection coordinates. Settings are only ever read from the process
//! environment so that credentials never appear on command lines.
//!
//! Recognized environment variables:
//!
//! - `ORACLE_CONNECT_STRING`, `ORACLE_USER`, `ORACLE_PASSWORD` (user and
//!   password are required; missing either is a fatal startup error)
//! - `ORAGUARD_MAX_COMPLEXITY`, `ORAGUARD_MAX_ROWS`,
//!   `ORAGUARD_ALLOW_CROSS_JOINS`, `ORAGUARD_RATE_MAX`,
//!   `ORAGUARD_RATE_WINDOW_SECONDS`, `ORAGUARD_APPROVAL_TTL_SECONDS`,
//!   `ORAGUARD_POOL_SIZE`, `ORAGUARD_ACQUIRE_TIMEOUT_SECONDS`,
//!   `ORAGUARD_QUERY_TIMEOUT_SECONDS`, `ORAGUARD_FETCH_CHUNK`,
//!   `ORAGUARD_FAILURE_THRESHOLD`, `ORAGUARD_RECOVERY_TIMEOUT_SECONDS`,
//!   `ORAGUARD_SUCCESS_THRESHOLD`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Admission and pool tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Reject statements scoring above this complexity ceiling.
    pub max_complexity: u32,

    /// Row cap applied by rewrite when the statement carries no bound.
    pub max_rows: u32,

    /// Permit a comma-separated top-level FROM list (off by default).
    pub allow_cross_joins: bool,

    /// Maximum requests admitted per sliding window.
    pub rate_max: usize,

    /// Sliding window length in seconds.
    pub rate_window_secs: u64,

    /// Approval token validity in seconds.
    pub approval_ttl_secs: u64,

    /// Number of long-lived database sessions.
    pub pool_size: usize,

    /// How long a caller may wait for an idle session.
    pub acquire_timeout_secs: u64,

    /// Per-statement timeout, applied server- and client-side.
    pub query_timeout_secs: u64,

    /// Fetch chunk configured on every session.
    pub fetch_chunk: u32,

    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,

    /// Cool-down before an open circuit probes again, in seconds.
    pub recovery_timeout_secs: u64,

    /// Consecutive probe successes before the circuit closes.
    pub success_threshold: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_complexity:        50,
            max_rows:              10_000,
            allow_cross_joins:     false,
            rate_max:              60,
            rate_window_secs:      60,
            approval_ttl_secs:     300,
            pool_size:             2,
            acquire_timeout_secs:  30,
            query_timeout_secs:    5,
            fetch_chunk:           1_000,
            failure_threshold:     5,
            recovery_timeout_secs: 60,
            success_threshold:     2,
        }
    }
}

impl GatewayConfig {
    /// Load the defaults, overlaying any `ORAGUARD_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Configuration` when a variable is present but
    /// unparseable, or when the resulting configuration fails validation.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        overlay(&mut config.max_complexity, "ORAGUARD_MAX_COMPLEXITY")?;
        overlay(&mut config.max_rows, "ORAGUARD_MAX_ROWS")?;
        overlay(&mut config.allow_cross_joins, "ORAGUARD_ALLOW_CROSS_JOINS")?;
        overlay(&mut config.rate_max, "ORAGUARD_RATE_MAX")?;
        overlay(&mut config.rate_window_secs, "ORAGUARD_RATE_WINDOW_SECONDS")?;
        overlay(&mut config.approval_ttl_secs, "ORAGUARD_APPROVAL_TTL_SECONDS")?;
        overlay(&mut config.pool_size, "ORAGUARD_POOL_SIZE")?;
        overlay(&mut config.acquire_timeout_secs, "ORAGUARD_ACQUIRE_TIMEOUT_SECONDS")?;
        overlay(&mut config.query_timeout_secs, "ORAGUARD_QUERY_TIMEOUT_SECONDS")?;
        overlay(&mut config.fetch_chunk, "ORAGUARD_FETCH_CHUNK")?;
        overlay(&mut config.failure_threshold, "ORAGUARD_FAILURE_THRESHOLD")?;
        overlay(&mut config.recovery_timeout_secs, "ORAGUARD_RECOVERY_TIMEOUT_SECONDS")?;
        overlay(&mut config.success_threshold, "ORAGUARD_SUCCESS_THRESHOLD")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate ranges that would otherwise wedge the pipeline.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Configuration` describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(GatewayError::config("pool_size must be at least 1"));
        }
        if self.max_rows == 0 {
            return Err(GatewayError::config("max_rows must be at least 1"));
        }
        if self.rate_max == 0 {
            return Err(GatewayError::config("rate_max must be at least 1"));
        }
        if self.rate_window_secs == 0 {
            return Err(GatewayError::config("rate_window_secs must be at least 1"));
        }
        if self.approval_ttl_secs == 0 {
            return Err(GatewayError::config("approval_ttl_secs must be at least 1"));
        }
        if self.query_timeout_secs == 0 {
            return Err(GatewayError::config("query_timeout_secs must be at least 1"));
        }
        if self.fetch_chunk == 0 {
            return Err(GatewayError::config("fetch_chunk must be at least 1"));
        }
        if self.failure_threshold == 0 {
            return Err(GatewayError::config("failure_threshold must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(GatewayError::config("success_threshold must be at least 1"));
        }
        Ok(())
    }
}

/// Database connection coordinates, read from the environment at startup.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Oracle connect string, e.g. `db.internal:1521/ORCLPDB1`.
    pub connect_string: String,

    /// Database user.
    pub user: String,

    /// Database password. Never logged; redacted from `Debug`.
    pub password: String,
}

impl DatabaseSettings {
    /// Read connection coordinates from the process environment.
    ///
    /// # Errors
    ///
    /// Missing `ORACLE_USER` or `ORACLE_PASSWORD` is fatal. The connect
    /// string falls back to a local default when unset.
    pub fn from_env() -> Result<Self> {
        let connect_string = std::env::var("ORACLE_CONNECT_STRING")
            .unwrap_or_else(|_| "localhost:1521/XEPDB1".to_string());

        let user = std::env::var("ORACLE_USER")
            .map_err(|_| GatewayError::config("ORACLE_USER must be set"))?;

        let password = std::env::var("ORACLE_PASSWORD")
            .map_err(|_| GatewayError::config("ORACLE_PASSWORD must be set"))?;

        if user.is_empty() {
            return Err(GatewayError::config("ORACLE_USER must not be empty"));
        }
        if password.is_empty() {
            return Err(GatewayError::config("ORACLE_PASSWORD must not be empty"));
        }

        Ok(Self {
            connect_string,
            user,
            password,
        })
    }
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("connect_string", &self.connect_string)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn overlay<T: FromStr>(slot: &mut T, var: &str) -> Result<()> {
    if let Ok(raw) = std::env::var(var) {
        *slot = raw
            .parse()
            .map_err(|_| GatewayError::config(format!("{var} has invalid value {raw:?}")))?;
    }
    Ok(())
}
