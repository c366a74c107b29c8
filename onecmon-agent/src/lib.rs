//! onecmon agent library.
//!
//! This library exposes internal modules for integration testing.
//! In production, `onecmon-agent` is used as a binary (main.rs).

pub mod cli;
pub mod commands;
pub mod error;
pub mod exporter;
pub mod identity;
pub mod logging;
pub mod orchestrator;
pub mod position_cache;
pub mod seances;
pub mod watcher;
