//! gcs: guest compute service.
//!
//! Runs inside a utility VM, speaks the framed bridge protocol to the host
//! and drives container lifecycles through an OCI runtime.

pub mod bridge;
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod runtime;
pub mod transport;
mod version;

pub use bridge::{Bridge, BridgeConfig, Publisher};
pub use error::{BridgeError, HandlerError};
pub use host::Host;
pub use version::GCS_VERSION;
