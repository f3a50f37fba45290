//! Logging setup for shellpool binaries and tests.
//!
//! Everything in the workspace logs through `tracing`; this crate installs
//! the global `tracing-subscriber` either as human-readable lines or as JSON
//! (suitable for Vector / Loki / ELK), driven by [`sp_core::config::LoggingConfig`].

pub mod logging;
