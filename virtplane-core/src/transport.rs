//! Remote RPC boundary.
//!
//! Everything the client knows about the control plane goes through the
//! [`Transport`] trait: authenticate, invoke a named method on a managed
//! object, read properties, and enumerate objects of a kind page by page.
//! The core never depends on a concrete implementation; [`crate::rest`]
//! speaks JSON/HTTP and [`crate::mock`] keeps an inventory in memory.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::error::{ControlPlaneError, Result};
use crate::types::ManagedObjectRef;
use crate::wire::{Page, PropertyMap};

/// Failures reported by a transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    /// Credentials expired or were rejected.
    #[error("unauthorized")]
    Unauthorized,

    /// Any client or server error other than unauthorized.
    #[error("status {code}: {body}")]
    Status { code: u16, body: String },

    /// The request never produced a status (connection, timeout, decoding).
    #[error("{0}")]
    Io(String),
}

/// Result type alias for transport calls.
pub type TransportResult<T> = std::result::Result<T, TransportFault>;

/// Address of a control-plane endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    /// Host name or IP extracted from `url`
    pub host: String,
}

impl Endpoint {
    /// Parse an endpoint URL such as `https://vcenter.example:443/sdk`.
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| ControlPlaneError::InvalidConfig(format!("endpoint url {}: {}", url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ControlPlaneError::InvalidConfig(format!("endpoint url {} has no host", url)))?;

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            host: host.to_string(),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Login credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opaque token identifying an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(String);

impl ConnectionHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Remote RPC primitive the client is built on.
#[async_trait]
pub trait Transport: Send + Sync {
    // =========================================================================
    // Authentication
    // =========================================================================

    /// Authenticate and return a fresh connection handle.
    ///
    /// Rejected credentials are reported as [`TransportFault::Unauthorized`].
    async fn login(&self, endpoint: &Endpoint, credentials: &Credentials)
        -> TransportResult<ConnectionHandle>;

    /// Invalidate a connection handle.
    async fn logout(&self, handle: &ConnectionHandle) -> TransportResult<()>;

    // =========================================================================
    // Managed Objects
    // =========================================================================

    /// Invoke a named method on a managed object.
    async fn invoke(
        &self,
        handle: &ConnectionHandle,
        target: &ManagedObjectRef,
        method: &str,
        args: &Value,
    ) -> TransportResult<Value>;

    /// Read property paths of one object. Unset paths are absent from the map.
    async fn get_properties(
        &self,
        handle: &ConnectionHandle,
        target: &ManagedObjectRef,
        paths: &[String],
    ) -> TransportResult<PropertyMap>;

    // =========================================================================
    // Enumeration
    // =========================================================================

    /// Start enumerating every object of `kind`, at most `page_size` per page.
    async fn enumerate(
        &self,
        handle: &ConnectionHandle,
        kind: &str,
        paths: &[String],
        page_size: usize,
    ) -> TransportResult<Page>;

    /// Fetch the next page of an enumeration.
    async fn continue_enumeration(
        &self,
        handle: &ConnectionHandle,
        token: &str,
    ) -> TransportResult<Page>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        let endpoint = Endpoint::parse("https://10.0.0.2/sdk/").unwrap();
        assert_eq!(endpoint.host, "10.0.0.2");
        assert_eq!(endpoint.url, "https://10.0.0.2/sdk");

        assert!(matches!(
            Endpoint::parse("not a url"),
            Err(ControlPlaneError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("admin", "s3cret");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("admin"));
        assert!(!printed.contains("s3cret"));
    }
}
