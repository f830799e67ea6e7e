//! Database layer: the opaque session seam and the slot pool that
//! multiplexes callers onto a small number of long-lived sessions.

pub mod identifier;
pub mod pool;
pub mod session;

pub use identifier::{is_valid_identifier, validate_identifier};
pub use pool::{PoolConfig, PoolHealth, SessionPool, SlotState};
pub use session::{OracleSession, SessionFactory, StatementOptions, TableData};
