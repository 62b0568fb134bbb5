//! Command-line front end.
//!
//! Provides argument parsing and command dispatch for the `treewatch` binary.

pub mod args;
pub mod commands;

pub use args::{Cli, Commands};
