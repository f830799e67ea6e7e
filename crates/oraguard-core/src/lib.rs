//! # oraguard-core
//!
//! Guarded query gateway for Oracle databases: a defense-in-depth admission
//! pipeline in front of a small pool of long-lived database sessions. The
//! tool-invocation layer dispatches named operations into [`Gateway`]; an
//! external proxy has already authenticated the caller, and the raw driver
//! is an opaque session behind [`db::SessionFactory`].
//!
//! ## Pipeline
//!
//! ```text
//! preview_query                    query_oracle
//!     |                                |
//! rate limiter                    rate limiter
//!     |                                |
//! normalizer + validator          approval registry (consume)
//!     |                                |
//! approval registry (issue)       validator (re-check)
//!     |                                |
//! token + verdict                 circuit breaker
//!                                      |
//!                                 session pool -> rows
//! ```
//!
//! Every branch emits structured [`audit::AuditRecord`] values; the emitter
//! buffers but never drops them.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use oraguard_core::{Gateway, GatewayConfig};
//! use oraguard_core::audit::{AuditEmitter, FileAuditSink};
//!
//! # async fn example(factory: Arc<dyn oraguard_core::db::SessionFactory>)
//! # -> oraguard_core::Result<()> {
//! let sink = FileAuditSink::open("audit.jsonl").await?;
//! let (emitter, _writer) = AuditEmitter::spawn(sink, 256);
//! let gateway = Gateway::connect(GatewayConfig::from_env()?, factory, emitter).await?;
//!
//! let preview = gateway.preview_query("SELECT id FROM users").await?;
//! if let Some(approval) = preview.approval {
//!     let result = gateway.query_oracle("SELECT id FROM users", &approval.token).await?;
//!     println!("{} rows", result.row_count);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Row counts and slot indices fit in the wire types they are cast into.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod resilience;
pub mod runtime;
pub mod security;
pub mod utils;

pub use config::{DatabaseSettings, GatewayConfig};
pub use error::{GatewayError, Result};
pub use runtime::Gateway;

/// Version of the gateway core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
