//! onecmon server library.
//!
//! This library exposes internal modules for integration testing.
//! In production, `onecmon-server` is used as a binary (main.rs).

pub mod catalog;
pub mod cli;
pub mod error;
pub mod health;
pub mod listener;
pub mod logging;
pub mod metrics_server;
pub mod orchestrator;
pub mod registry;
pub mod session;
