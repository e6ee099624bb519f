//! Runtime glue that wires configs, the bot callback, session lifecycle,
//! telemetry, and runner orchestration.

pub mod bot;
pub mod config;
pub(crate) mod lifecycle;
pub mod runner;
pub mod session;
pub mod telemetry;
