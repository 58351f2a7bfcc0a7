//! Command implementations
//!
//! Each subcommand has its own module with a `run` function.

pub mod cursor;
pub mod lease;
pub mod migrate;
pub mod run;
