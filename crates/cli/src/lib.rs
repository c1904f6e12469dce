//! Meshgate CLI
//!
//! Command definitions and output rendering for the `meshgate` binary.

pub mod commands;
pub mod output;
