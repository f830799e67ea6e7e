//! Shared capabilities injected into the pipeline components.

pub mod clock;
pub mod entropy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entropy::{CountingEntropy, OsEntropy, TokenEntropy};
