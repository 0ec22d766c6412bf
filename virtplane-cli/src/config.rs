//! Configuration management for the CLI.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use virtplane_core::ClientConfig;

use crate::cli::Args;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/virtplane/client.yaml";

/// Which transport the client talks through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// JSON/HTTP gateway
    #[default]
    Rest,
    /// In-memory demo inventory
    Simulator,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport: TransportKind,
    #[serde(flatten)]
    pub client: ClientConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Load the explicit path, else the default path, else defaults.
    pub fn resolve(args: &Args) -> Result<Self> {
        let config = match &args.config {
            Some(path) => Self::load(path)?,
            None => match Self::load(DEFAULT_CONFIG_PATH) {
                Ok(config) => config,
                Err(e) => {
                    tracing::debug!(error = %e, "No usable default config, using defaults");
                    Self::default()
                }
            },
        };
        Ok(config.with_cli_overrides(args))
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref endpoint) = args.endpoint {
            self.client.endpoint.url = endpoint.clone();
        }

        if let Some(ref username) = args.username {
            self.client.endpoint.username = username.clone();
        }

        if let Some(ref password) = args.password {
            self.client.endpoint.password = password.clone();
        }

        if args.dev {
            self.transport = TransportKind::Simulator;
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use virtplane_core::ControllerSetting;

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
transport: rest
endpoint:
  url: https://vcenter.lab/sdk
  username: administrator@vsphere.local
  password: hunter2
  controller: central
  accept_invalid_certs: true
vnc:
  port_start: 6000
  port_count: 100
tasks:
  timeout_secs: 600
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.transport, TransportKind::Rest);
        assert_eq!(config.client.endpoint.url, "https://vcenter.lab/sdk");
        assert_eq!(config.client.endpoint.controller, ControllerSetting::Central);
        assert!(config.client.endpoint.accept_invalid_certs);
        assert_eq!(config.client.vnc.port_start, 6000);
        assert_eq!(config.client.vnc.keymap, "en-us");
        assert_eq!(config.client.tasks.timeout_secs, 600);
        assert_eq!(config.client.tasks.poll_interval_ms, 3000);
        assert_eq!(config.client.inventory.page_size, 100);
        assert!(config.client.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.transport, TransportKind::Rest);
        assert_eq!(config.client.endpoint.request_timeout_secs, 60);
    }

    #[test]
    fn test_unknown_controller_rejected() {
        assert!(Config::from_yaml("endpoint:\n  controller: cluster\n").is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::try_parse_from([
            "virtplane",
            "--dev",
            "--endpoint",
            "https://esx-01.lab/sdk",
            "--username",
            "root",
            "hosts",
        ])
        .unwrap();

        let config = Config::default().with_cli_overrides(&args);
        assert_eq!(config.transport, TransportKind::Simulator);
        assert_eq!(config.client.endpoint.url, "https://esx-01.lab/sdk");
        assert_eq!(config.client.endpoint.username, "root");
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        assert!(Config::load("/nonexistent/virtplane.yaml").is_err());
    }
}
