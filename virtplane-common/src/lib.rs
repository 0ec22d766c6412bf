//! # virtplane Common
//!
//! Shared utilities for the virtplane binaries.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use virtplane_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! tracing::info!(endpoint = "https://vc.example/sdk", "Connecting");
//! ```

pub mod logging;

pub use logging::{build_filter, init_logging, init_logging_json, LogFormat};
