//! CLI command implementations.
//!
//! - [`run`] - Load stdin into the built-in destination
//! - [`config`] - Print the effective configuration

pub mod config;
pub mod run;
