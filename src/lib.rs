//! Minimal service supervisor for containers.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
#[cfg(test)]
use predicates as _;
use strum as _;
#[cfg(test)]
use tempfile as _;
// Logging is initialised by the binary (src/bin/main.rs)
use tracing_subscriber as _;

/// CLI parsing.
pub mod cli;

/// Control-command dispatch.
pub mod command;

/// Control-socket wire protocol.
pub mod control;

/// Duration strings.
pub mod duration;

/// Errors.
pub mod error;

/// The loaded-unit graph.
pub mod graph;

/// Log viewing.
pub mod journal;

/// Per-service log files.
pub mod logwriter;

/// Filesystem layout.
pub mod paths;

/// Fork tracking.
pub mod pidtrack;

/// Zombie reaping.
pub mod reaper;

/// Unit lifecycle.
pub mod service;

/// Supervisor context and control loop.
pub mod supervisor;

/// Unit records and parsing.
pub mod unit;
