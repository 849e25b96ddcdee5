//! CLI configuration
//!
//! An optional TOML file layered over defaults. The `[peer]` table is a
//! complete [`PeerConfig`]; `[demo]` names the two in-process endpoints.
//!
//! ```toml
//! [peer.connection]
//! namespace = "lab"
//! ping_interval = 1000
//!
//! [peer.circuit_breaker]
//! max_failures = 5
//!
//! [runtime]
//! event_buffer = 1024
//!
//! [demo]
//! secret = "open sesame"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use pacpam_core::{Identity, PeerConfig, RuntimeConfig};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Configuration shared by both demo endpoints
    pub peer: PeerConfig,
    pub runtime: RuntimeConfig,
    pub demo: DemoConfig,
}

/// The two endpoints a demo runs in-process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Identity of the dialing side
    pub host: String,
    /// Identity of the answering side
    pub guest: String,
    /// Shared secret for the auth handshake
    pub secret: String,
    /// How long to wait for any single demo step
    pub step_timeout_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            host: "alice".to_string(),
            guest: "bob".to_string(),
            secret: "pacpam-demo".to_string(),
            step_timeout_ms: 5_000,
        }
    }
}

impl DemoConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "reading configuration");
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.peer.validate()?;
        self.runtime.validate()?;
        for identity in [&self.demo.host, &self.demo.guest] {
            Identity::parse(identity)
                .map_err(|e| CliError::Config(format!("demo identity '{identity}': {e}")))?;
        }
        if self.demo.host == self.demo.guest {
            return Err(CliError::Config("demo host and guest must differ".to_string()));
        }
        if self.demo.secret.is_empty() {
            return Err(CliError::Config("demo secret must not be empty".to_string()));
        }
        if self.demo.step_timeout_ms == 0 {
            return Err(CliError::Config("demo step timeout must be greater than 0".to_string()));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.demo.host, "alice");
        assert_eq!(config.peer, PeerConfig::default());
    }

    #[test]
    fn test_partial_toml_over_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [peer.connection]
            namespace = "lab"
            ping_interval = 1000

            [peer.circuit_breaker]
            max_failures = 5

            [runtime]
            event_buffer = 1024

            [demo]
            secret = "open sesame"
            "#,
        )
        .unwrap();
        assert_eq!(config.peer.connection.namespace, "lab");
        assert_eq!(config.peer.connection.ping_interval, Duration::from_millis(1_000));
        assert_eq!(config.peer.circuit_breaker.max_failures, 5);
        assert_eq!(config.runtime.event_buffer, 1_024);
        assert_eq!(config.runtime.command_buffer, RuntimeConfig::default().command_buffer);
        assert_eq!(
            config.peer.presence,
            PeerConfig::default().presence,
            "untouched tables keep their defaults"
        );
        assert_eq!(config.demo.secret, "open sesame");
        assert_eq!(config.demo.guest, "bob");
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(matches!(
            AppConfig::from_toml("[peer.circuit_breaker]\nmax_failures = 0\n"),
            Err(CliError::Pacpam(_))
        ));
        assert!(matches!(
            AppConfig::from_toml("[demo]\nhost = \"x\"\n"),
            Err(CliError::Config(_))
        ));
        assert!(matches!(
            AppConfig::from_toml("[demo]\nguest = \"alice\"\n"),
            Err(CliError::Config(_))
        ));
        assert!(matches!(AppConfig::from_toml("peer = 3"), Err(CliError::TomlParsing(_))));
    }
}
