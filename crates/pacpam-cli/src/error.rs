//! Error handling for the pacpam CLI

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("pacpam error: {0}")]
    Pacpam(#[from] pacpam_core::PacpamError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Demo failed: {0}")]
    Demo(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
