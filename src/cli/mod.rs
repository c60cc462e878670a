//! CLI command implementations.

pub mod commands;
pub mod exec;
