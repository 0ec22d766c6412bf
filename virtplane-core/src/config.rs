//! Client configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ControlPlaneError, Result};
use crate::transport::{Credentials, Endpoint};

/// Full client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoint: EndpointConfig,
    pub vnc: VncConfig,
    pub tasks: TaskConfig,
    pub inventory: InventoryConfig,
}

/// How the endpoint's role is determined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerSetting {
    /// Ask the endpoint (`about.apiType`)
    #[default]
    Auto,
    /// The endpoint is one bare host
    Standalone,
    /// The endpoint is a central manager fronting many hosts
    Central,
}

/// Control-plane endpoint configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub controller: ControllerSetting,
    pub request_timeout_secs: u64,
    pub accept_invalid_certs: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: "https://127.0.0.1/sdk".to_string(),
            username: "root".to_string(),
            password: String::new(),
            controller: ControllerSetting::Auto,
            request_timeout_secs: 60,
            accept_invalid_certs: false,
        }
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("controller", &self.controller)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}

/// VNC console configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VncConfig {
    /// First port of the lease range
    pub port_start: u16,
    /// Number of ports in the range
    pub port_count: u16,
    pub keymap: String,
}

impl Default for VncConfig {
    fn default() -> Self {
        Self {
            port_start: 5900,
            port_count: 1000,
            keymap: "en-us".to_string(),
        }
    }
}

/// Task polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3000,
            timeout_secs: 120,
        }
    }
}

impl TaskConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Inventory traversal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub page_size: usize,
    /// Datastores whose name starts with this, up to the first `_`, are never used
    pub reserved_datastore_prefix: String,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            reserved_datastore_prefix: "Drp".to_string(),
        }
    }
}

impl ClientConfig {
    /// Check the configuration for values the client cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.url.trim().is_empty() {
            return Err(ControlPlaneError::InvalidConfig("endpoint url is empty".to_string()));
        }
        if self.inventory.page_size == 0 {
            return Err(ControlPlaneError::InvalidConfig("page_size must be positive".to_string()));
        }
        if self.vnc.port_count == 0 {
            return Err(ControlPlaneError::InvalidConfig("vnc port_count must be positive".to_string()));
        }
        if u32::from(self.vnc.port_start) + u32::from(self.vnc.port_count) > u32::from(u16::MAX) + 1 {
            return Err(ControlPlaneError::InvalidConfig(format!(
                "vnc port range {}+{} overflows the port space",
                self.vnc.port_start, self.vnc.port_count
            )));
        }
        if self.tasks.poll_interval_ms == 0 {
            return Err(ControlPlaneError::InvalidConfig(
                "task poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn parsed_endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.endpoint.url)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.endpoint.username, &self.endpoint.password)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.endpoint.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.vnc.port_start, 5900);
        assert_eq!(config.vnc.port_count, 1000);
        assert_eq!(config.tasks.timeout(), Duration::from_secs(120));
        assert_eq!(config.inventory.reserved_datastore_prefix, "Drp");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ClientConfig::default();
        config.inventory.page_size = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.vnc.port_start = 65000;
        config.vnc.port_count = 1000;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.vnc.port_start = 65535;
        config.vnc.port_count = 1;
        assert!(config.validate().is_ok());

        let mut config = ClientConfig::default();
        config.endpoint.url = "  ".to_string();
        assert!(matches!(config.validate(), Err(ControlPlaneError::InvalidConfig(_))));
    }

    #[test]
    fn test_password_not_in_debug_output() {
        let mut config = ClientConfig::default();
        config.endpoint.password = "hunter2".to_string();
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
