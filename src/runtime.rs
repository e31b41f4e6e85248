//! Runtime glue that wires configuration files, telemetry, and runner
//! orchestration around the sync engine.

pub mod config;
pub mod runner;
pub mod settings;
pub mod telemetry;
