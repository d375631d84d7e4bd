//! Command production for the exerciser
//!
//! This module handles:
//! - Parsing raw command lines into typed commands
//! - Supplying the command fired on each cycle
//! - Running command production on a bounded worker pool

mod codec;
mod pool;
mod source;

pub use codec::Command;
pub use pool::{PoolError, WorkerPool};
pub use source::{CommandSource, FixedCommandSource};
