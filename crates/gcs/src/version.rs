//! Version information for the agent.

/// Agent version from Cargo.toml, reported during protocol negotiation.
pub const GCS_VERSION: &str = env!("CARGO_PKG_VERSION");
