//! Authenticated session with transparent re-login.
//!
//! A [`Session`] logs in lazily on first use and caches the connection handle.
//! When a call comes back unauthorized it logs in exactly once more and
//! retries; a second unauthorized reply is an `AuthorizationFailure`.
//!
//! Concurrent callers that hit the same expired handle share one re-login:
//! each records the generation it used, and only the first caller through
//! the re-login mutex actually logs in. The others see a newer generation
//! and reuse its handle.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::error::{ControlPlaneError, Result};
use crate::transport::{
    ConnectionHandle, Credentials, Endpoint, Transport, TransportFault, TransportResult,
};
use crate::types::ManagedObjectRef;
use crate::wire::{ObjectContent, Page, PropertyMap};

/// A single remote request, replayable after re-login.
#[derive(Debug, Clone)]
pub enum Request {
    Invoke {
        target: ManagedObjectRef,
        method: String,
        args: Value,
    },
    Properties {
        target: ManagedObjectRef,
        paths: Vec<String>,
    },
    Enumerate {
        kind: String,
        paths: Vec<String>,
        page_size: usize,
    },
    Continue {
        token: String,
    },
}

impl Request {
    /// What the request was aimed at, for error reports.
    fn target_label(&self) -> String {
        match self {
            Request::Invoke { target, method, .. } => format!("{}.{}", target, method),
            Request::Properties { target, .. } => target.to_string(),
            Request::Enumerate { kind, .. } => kind.clone(),
            Request::Continue { .. } => "enumeration".to_string(),
        }
    }
}

/// Reply to a [`Request`].
#[derive(Debug, Clone)]
pub enum Reply {
    Value(Value),
    Properties(PropertyMap),
    Page(Page),
}

struct SessionState {
    handle: Option<ConnectionHandle>,
    generation: u64,
}

/// One authenticated connection to a control plane, shared by every
/// component of a client.
pub struct Session {
    endpoint: Endpoint,
    credentials: Credentials,
    transport: Arc<dyn Transport>,
    page_size: usize,
    state: RwLock<SessionState>,
    relogin: Mutex<()>,
}

impl Session {
    /// Create a session. Nothing is sent until the first call.
    pub fn new(
        endpoint: Endpoint,
        credentials: Credentials,
        transport: Arc<dyn Transport>,
        page_size: usize,
    ) -> Self {
        Self {
            endpoint,
            credentials,
            transport,
            page_size: page_size.max(1),
            state: RwLock::new(SessionState {
                handle: None,
                generation: 0,
            }),
            relogin: Mutex::new(()),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Number of successful logins so far. Object references obtained under
    /// an older generation may be stale.
    pub async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.handle.is_some()
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Issue a request, re-authenticating once if the handle was rejected.
    pub async fn call(&self, request: Request) -> Result<Reply> {
        let (handle, generation) = self.current_handle().await?;

        match self.dispatch(&handle, &request).await {
            Ok(reply) => return Ok(reply),
            Err(TransportFault::Unauthorized) => {
                warn!(
                    target_label = %request.target_label(),
                    generation,
                    "Session rejected, re-authenticating"
                );
            }
            Err(fault) => return Err(self.classify(&request, fault)),
        }

        let (handle, _) = self.reauthenticate(Some(generation)).await?;
        match self.dispatch(&handle, &request).await {
            Ok(reply) => Ok(reply),
            Err(fault) => Err(self.classify(&request, fault)),
        }
    }

    /// Invoke a remote method.
    pub async fn invoke(&self, target: &ManagedObjectRef, method: &str, args: Value) -> Result<Value> {
        match self
            .call(Request::Invoke {
                target: target.clone(),
                method: method.to_string(),
                args,
            })
            .await?
        {
            Reply::Value(value) => Ok(value),
            other => Err(unexpected("value", &other)),
        }
    }

    /// Read property paths of one object.
    pub async fn properties(&self, target: &ManagedObjectRef, paths: &[&str]) -> Result<PropertyMap> {
        match self
            .call(Request::Properties {
                target: target.clone(),
                paths: paths.iter().map(|p| p.to_string()).collect(),
            })
            .await?
        {
            Reply::Properties(props) => Ok(props),
            other => Err(unexpected("properties", &other)),
        }
    }

    /// Read a single property; `None` when unset.
    pub async fn property(&self, target: &ManagedObjectRef, path: &str) -> Result<Option<Value>> {
        let mut props = self.properties(target, &[path]).await?;
        Ok(props.remove(path).filter(|v| !v.is_null()))
    }

    /// Enumerate every object of `kind`, following continuation tokens until
    /// the remote side reports exhaustion.
    #[instrument(skip(self, paths), fields(kind = %kind))]
    pub async fn enumerate_all(&self, kind: &str, paths: &[&str]) -> Result<Vec<ObjectContent>> {
        let mut page = self
            .page(Request::Enumerate {
                kind: kind.to_string(),
                paths: paths.iter().map(|p| p.to_string()).collect(),
                page_size: self.page_size,
            })
            .await?;

        let mut objects = Vec::new();
        let mut pages = 1;
        loop {
            objects.extend(page.objects);
            match page.token {
                Some(token) => {
                    page = self.page(Request::Continue { token }).await?;
                    pages += 1;
                }
                None => break,
            }
        }

        debug!(count = objects.len(), pages, "Enumeration complete");
        Ok(objects)
    }

    async fn page(&self, request: Request) -> Result<Page> {
        match self.call(request).await? {
            Reply::Page(page) => Ok(page),
            other => Err(unexpected("page", &other)),
        }
    }

    /// Log out and drop the handle. The next call logs in again.
    pub async fn close(&self) -> Result<()> {
        let handle = {
            let mut state = self.state.write().await;
            state.handle.take()
        };

        if let Some(handle) = handle {
            info!(endpoint = %self.endpoint, "Closing session");
            self.transport
                .logout(&handle)
                .await
                .map_err(|fault| self.classify_login(fault))?;
        }
        Ok(())
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    async fn current_handle(&self) -> Result<(ConnectionHandle, u64)> {
        {
            let state = self.state.read().await;
            if let Some(handle) = &state.handle {
                return Ok((handle.clone(), state.generation));
            }
        }
        self.reauthenticate(None).await
    }

    /// Log in, unless another caller already replaced the handle that was
    /// rejected under generation `stale`.
    async fn reauthenticate(&self, stale: Option<u64>) -> Result<(ConnectionHandle, u64)> {
        let _guard = self.relogin.lock().await;

        {
            let state = self.state.read().await;
            if let Some(handle) = &state.handle {
                let superseded = match stale {
                    None => true,
                    Some(generation) => state.generation != generation,
                };
                if superseded {
                    return Ok((handle.clone(), state.generation));
                }
            }
        }

        info!(endpoint = %self.endpoint, user = %self.credentials.username, "Logging in");
        let handle = self
            .transport
            .login(&self.endpoint, &self.credentials)
            .await
            .map_err(|fault| self.classify_login(fault))?;

        let mut state = self.state.write().await;
        state.handle = Some(handle.clone());
        state.generation += 1;
        debug!(generation = state.generation, "Session established");
        Ok((handle, state.generation))
    }

    async fn dispatch(&self, handle: &ConnectionHandle, request: &Request) -> TransportResult<Reply> {
        match request {
            Request::Invoke { target, method, args } => self
                .transport
                .invoke(handle, target, method, args)
                .await
                .map(Reply::Value),
            Request::Properties { target, paths } => self
                .transport
                .get_properties(handle, target, paths)
                .await
                .map(Reply::Properties),
            Request::Enumerate { kind, paths, page_size } => self
                .transport
                .enumerate(handle, kind, paths, *page_size)
                .await
                .map(Reply::Page),
            Request::Continue { token } => self
                .transport
                .continue_enumeration(handle, token)
                .await
                .map(Reply::Page),
        }
    }

    fn classify(&self, request: &Request, fault: TransportFault) -> ControlPlaneError {
        match fault {
            TransportFault::Unauthorized => ControlPlaneError::AuthorizationFailure {
                endpoint: self.endpoint.to_string(),
            },
            TransportFault::Status { code, body } => ControlPlaneError::RemoteOperation {
                target: request.target_label(),
                code,
                body,
            },
            TransportFault::Io(message) => ControlPlaneError::Transport(message),
        }
    }

    fn classify_login(&self, fault: TransportFault) -> ControlPlaneError {
        match fault {
            TransportFault::Unauthorized => ControlPlaneError::AuthorizationFailure {
                endpoint: self.endpoint.to_string(),
            },
            TransportFault::Status { code, body } => ControlPlaneError::RemoteOperation {
                target: "session".to_string(),
                code,
                body,
            },
            TransportFault::Io(message) => ControlPlaneError::Transport(message),
        }
    }
}

fn unexpected(expected: &str, reply: &Reply) -> ControlPlaneError {
    let got = match reply {
        Reply::Value(_) => "value",
        Reply::Properties(_) => "properties",
        Reply::Page(_) => "page",
    };
    ControlPlaneError::MalformedReply(format!("expected {} reply, got {}", expected, got))
}
