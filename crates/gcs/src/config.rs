//! Command-line configuration of the agent.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use gcs_bridge::ProtocolVersion;
use gcs_bridge::codec::DEFAULT_MAX_PAYLOAD;

use crate::bridge::BridgeConfig;
use crate::logging::{LogConfig, LogFormat};
use crate::transport::DEFAULT_COMMAND_PORT;

#[cfg(unix)]
use crate::runtime::RuncConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum RuntimeKind {
    /// OCI containers through the runc CLI.
    #[default]
    Runc,
    /// Plain host processes, no isolation.
    Shim,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "gcs", version, about = "Guest compute service")]
pub struct AgentConfig {
    /// Log level: trace, debug, info, warn or error.
    #[arg(long = "loglevel", env = "GCS_LOGLEVEL", default_value = "debug")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(long = "logfile", env = "GCS_LOGFILE")]
    pub log_file: Option<PathBuf>,

    #[arg(long, env = "GCS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Bridge over stdin/stdout instead of vsock.
    #[arg(long = "use-inouterr", env = "GCS_USE_INOUTERR")]
    pub use_inouterr: bool,

    /// Offer protocol V4 during negotiation.
    #[arg(long = "v4", env = "GCS_V4")]
    pub v4: bool,

    #[arg(long, env = "GCS_RUNTIME", value_enum, default_value_t = RuntimeKind::Runc)]
    pub runtime: RuntimeKind,

    #[arg(long, env = "GCS_RUNC_BINARY", default_value = "runc")]
    pub runc_binary: PathBuf,

    #[arg(long, env = "GCS_RUNC_ROOT", default_value = "/run/runc")]
    pub runc_root: PathBuf,

    /// Base directory for container bundles.
    #[arg(long, env = "GCS_BUNDLE_ROOT", default_value = "/run/gcs/c")]
    pub bundle_root: PathBuf,

    /// Host vsock port to dial, decimal or 0x-prefixed hex.
    #[arg(long, env = "GCS_VSOCK_PORT", value_parser = parse_port, default_value_t = DEFAULT_COMMAND_PORT)]
    pub vsock_port: u32,

    /// Grace period for in-flight requests after a shutdown request.
    #[arg(long, env = "GCS_SHUTDOWN_GRACE_MS", default_value_t = 5000)]
    pub shutdown_grace_ms: u64,
}

impl AgentConfig {
    pub fn max_version(&self) -> ProtocolVersion {
        if self.v4 {
            ProtocolVersion::V4
        } else {
            ProtocolVersion::V3
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            max_version: self.max_version(),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    #[cfg(unix)]
    pub fn runc_config(&self) -> RuncConfig {
        RuncConfig {
            binary: self.runc_binary.clone(),
            root: self.runc_root.clone(),
            bundle_root: self.bundle_root.clone(),
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            format: self.log_format,
            file: self.log_file.clone(),
        }
    }
}

fn parse_port(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid port {value:?}: {e}"))
}
