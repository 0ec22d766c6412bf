//! JSON-over-HTTP transport.
//!
//! Routes, relative to the endpoint URL:
//!
//! | Operation              | Request                                          |
//! |------------------------|--------------------------------------------------|
//! | login                  | `POST /session` (basic auth) → `{"token": ..}`   |
//! | logout                 | `DELETE /session`                                |
//! | invoke                 | `POST /objects/{kind}/{id}/invoke/{method}`      |
//! | get_properties         | `POST /objects/{kind}/{id}/properties`           |
//! | enumerate              | `POST /collector/{kind}`                         |
//! | continue_enumeration   | `POST /collector/continue`                       |
//!
//! Authenticated requests carry the token in the `vmware-api-session-id`
//! header.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::error::{ControlPlaneError, Result};
use crate::transport::{ConnectionHandle, Credentials, Endpoint, Transport, TransportFault, TransportResult};
use crate::types::ManagedObjectRef;
use crate::wire::{Page, PropertyMap};

const SESSION_HEADER: &str = "vmware-api-session-id";

#[derive(Deserialize)]
struct LoginReply {
    token: String,
}

/// [`Transport`] speaking JSON to a control-plane gateway.
pub struct RestTransport {
    client: Client,
    base_url: String,
}

impl RestTransport {
    /// `endpoint` is the base URL for every call made with a connection
    /// handle. Login goes to the endpoint passed to [`Transport::login`].
    pub fn new(endpoint: &Endpoint, timeout: Duration, accept_invalid_certs: bool) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .timeout(timeout)
            .build()
            .map_err(|e| ControlPlaneError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: endpoint.url.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn session_url(endpoint: &Endpoint) -> String {
        format!("{}/session", endpoint.url)
    }

    fn object_url(&self, target: &ManagedObjectRef, suffix: &str) -> String {
        self.url(&format!("/objects/{}/{}/{}", target.kind, target.id, suffix))
    }

    async fn send(request: RequestBuilder) -> TransportResult<reqwest::Response> {
        let response = request.send().await.map_err(|e| TransportFault::Io(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> TransportResult<T> {
        let response = Self::send(request).await?;
        response
            .json()
            .await
            .map_err(|e| TransportFault::Io(format!("failed to decode reply: {}", e)))
    }

    fn authed(&self, request: RequestBuilder, handle: &ConnectionHandle) -> RequestBuilder {
        request.header(SESSION_HEADER, handle.as_str())
    }
}

/// Map a non-success HTTP status to a transport fault.
pub fn classify_status(status: StatusCode, body: String) -> TransportFault {
    if status == StatusCode::UNAUTHORIZED {
        TransportFault::Unauthorized
    } else {
        TransportFault::Status {
            code: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
impl Transport for RestTransport {
    async fn login(&self, endpoint: &Endpoint, credentials: &Credentials) -> TransportResult<ConnectionHandle> {
        debug!(endpoint = %endpoint, user = %credentials.username, "POST /session");
        let request = self
            .client
            .post(Self::session_url(endpoint))
            .basic_auth(&credentials.username, Some(&credentials.password));
        let reply: LoginReply = Self::send_json(request).await?;
        Ok(ConnectionHandle::new(reply.token))
    }

    async fn logout(&self, handle: &ConnectionHandle) -> TransportResult<()> {
        let request = self.authed(self.client.delete(self.url("/session")), handle);
        Self::send(request).await?;
        Ok(())
    }

    async fn invoke(
        &self,
        handle: &ConnectionHandle,
        target: &ManagedObjectRef,
        method: &str,
        args: &Value,
    ) -> TransportResult<Value> {
        let url = self.object_url(target, &format!("invoke/{}", method));
        trace!(%url, "invoke");
        let response = Self::send(self.authed(self.client.post(url), handle).json(args)).await?;
        let text = response.text().await.map_err(|e| TransportFault::Io(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| TransportFault::Io(format!("failed to decode reply: {}", e)))
    }

    async fn get_properties(
        &self,
        handle: &ConnectionHandle,
        target: &ManagedObjectRef,
        paths: &[String],
    ) -> TransportResult<PropertyMap> {
        let url = self.object_url(target, "properties");
        let request = self.authed(self.client.post(url), handle).json(&json!({"paths": paths}));
        Self::send_json(request).await
    }

    async fn enumerate(
        &self,
        handle: &ConnectionHandle,
        kind: &str,
        paths: &[String],
        page_size: usize,
    ) -> TransportResult<Page> {
        let url = self.url(&format!("/collector/{}", kind));
        let request = self
            .authed(self.client.post(url), handle)
            .json(&json!({"pageSize": page_size, "paths": paths}));
        Self::send_json(request).await
    }

    async fn continue_enumeration(&self, handle: &ConnectionHandle, token: &str) -> TransportResult<Page> {
        let request = self
            .authed(self.client.post(self.url("/collector/continue")), handle)
            .json(&json!({"token": token}));
        Self::send_json(request).await
    }
}
