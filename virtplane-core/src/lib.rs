//! # virtplane Core
//!
//! Client library for virtualization control planes that either front many
//! hypervisor hosts (a central manager) or are a single host.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  ControlPlaneClient                     │
//! └───────┬──────────────┬──────────────┬──────────────┬────┘
//!         ▼              ▼              ▼              ▼
//! ┌──────────────┐ ┌────────────┐ ┌────────────┐ ┌──────────────┐
//! │ Orchestrator │ │SpecBuilder │ │  Resolver  │ │  Allocator   │
//! │ + TaskWaiter │ │            │ │ + Networks │ │ (VNC, keys)  │
//! └──────┬───────┘ └─────┬──────┘ └─────┬──────┘ └──────┬───────┘
//!        └───────────────┴──────┬───────┴───────────────┘
//!                               ▼
//!                  ┌─────────────────────────┐
//!                  │ Session (login, retry)  │
//!                  └────────────┬────────────┘
//!                               ▼
//!                  ┌─────────────────────────┐
//!                  │    Transport trait      │
//!                  └──────┬───────────┬──────┘
//!                         ▼           ▼
//!                  RestTransport   MockControlPlane
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use virtplane_core::{ClientConfig, ControlPlaneClient, CreateVmRequest, MockControlPlane, Sizing};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = ControlPlaneClient::new(ClientConfig::default(), Arc::new(MockControlPlane::demo())).unwrap();
//!
//!     let request = CreateVmRequest {
//!         name: "web-02".to_string(),
//!         host: "10.0.0.5".to_string(),
//!         sizing: Sizing::new(2, 1, 4096),
//!         ..Default::default()
//!     };
//!     let created = client.vms().create(&request).await.unwrap();
//!     client.vms().power_on("web-02").await.unwrap();
//! }
//! ```

pub mod allocator;
pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod mock;
pub mod network;
pub mod resolver;
pub mod rest;
pub mod session;
pub mod spec;
pub mod task;
pub mod transport;
pub mod types;
pub mod wire;

pub use allocator::{allocate_device_keys, DeviceKeys, IdentifierAllocator, VncPortRange};
pub use client::ControlPlaneClient;
pub use config::{ClientConfig, ControllerSetting, EndpointConfig, InventoryConfig, TaskConfig, VncConfig};
pub use error::{ControlPlaneError, Result};
pub use lifecycle::{CreateVmRequest, Operation, Orchestrator, VmPhase};
pub use mock::MockControlPlane;
pub use network::{NetworkNormalizer, PortGroupManager};
pub use resolver::Resolver;
pub use rest::RestTransport;
pub use session::Session;
pub use spec::SpecBuilder;
pub use task::TaskWaiter;
pub use transport::{ConnectionHandle, Credentials, Endpoint, Transport, TransportFault};
pub use types::*;
