//! Command exerciser
//!
//! This module handles:
//! - The sequential dispatch loop and its shutdown
//! - Epoch tracking across reconnects
//! - Pacing between cycles
//! - Reporting device responses

mod commander;
mod cycle;
mod pacing;
mod reporter;

pub use commander::{Exerciser, ExerciserSettings};
pub use pacing::Pacing;
pub use reporter::LogReporter;
