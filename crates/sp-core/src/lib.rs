//! Shared building blocks for the shellpool workspace.
//!
//! - **config**: TOML configuration for the device, pool, retry policy,
//!   session timeouts and logging
//! - **secret**: credentials that are zeroed on drop and never printed
//! - **sanitize**: redaction of command lines before they reach the logs

pub mod config;
pub mod sanitize;
pub mod secret;
