//! Error types for the control-plane client.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to a virtualization control plane.
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// Credentials were rejected, either at login or after the single re-login retry.
    #[error("Authorization failed for endpoint {endpoint}")]
    AuthorizationFailure { endpoint: String },

    /// The transport could not deliver the request (connection refused, timeout, ...).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote side answered with a client or server error.
    #[error("Remote operation on {target} failed with status {code}: {body}")]
    RemoteOperation {
        target: String,
        code: u16,
        body: String,
    },

    /// An object could not be resolved from its human-facing identity.
    #[error("{kind} not found: {identity}")]
    NotFound { kind: String, identity: String },

    /// No usable datastore is attached to the host.
    #[error("No datastore with free space attached to host {host}")]
    NoDatastore { host: String },

    /// A distributed VLAN representation this client does not understand.
    #[error("Unsupported VLAN representation: {0}")]
    UnsupportedVlanKind(String),

    /// Network adapter model identifier not in the supported set.
    #[error("Unsupported network adapter model: {model}")]
    UnsupportedAdapterModel { model: String },

    /// Every VNC port in the configured range is in use.
    #[error("VNC port range {start}-{end} exhausted")]
    PortRangeExhausted { start: u32, end: u32 },

    /// The operation cannot start from the current state.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// A task did not complete within the allotted time. The remote outcome is unknown.
    #[error("Task {task} did not complete within {waited:?}")]
    Timeout { task: String, waited: Duration },

    /// The remote task terminated in the error state.
    #[error("Task {task} failed: {error}")]
    TaskFailed {
        task: String,
        error: serde_json::Value,
    },

    /// The network exists but cannot carry a VM adapter.
    #[error("Network {network} cannot be attached: {reason}")]
    NetworkNotAttachable { network: String, reason: String },

    /// A reply that could not be decoded into the expected shape.
    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ControlPlaneError {
    /// Shorthand for [`ControlPlaneError::NotFound`].
    pub fn not_found(kind: &str, identity: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            identity: identity.into(),
        }
    }

    /// True for the `NotFound` variant.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type alias for control-plane operations.
pub type Result<T> = std::result::Result<T, ControlPlaneError>;
