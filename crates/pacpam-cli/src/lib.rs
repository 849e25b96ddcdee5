//! pacpam CLI library
//!
//! Argument parsing, TOML configuration, the in-process demos and diagram
//! export behind the `pacpam` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod demo;
pub mod error;

pub use cli::{Cli, Commands};
pub use config::AppConfig;
pub use error::{CliError, Result};
