//! Agent error types.
//!
//! [`HandlerError`] is what a request can fail with; each variant maps onto
//! exactly one wire [`ErrorKind`]. [`BridgeError`] ends a connection.

use gcs_bridge::{ErrorKind, ErrorRecord, FrameError, VersionViolation};

use crate::runtime::RuntimeError;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("unknown message type {0:#010x}")]
    UnknownMessageType(u32),

    #[error("{0}")]
    ProtocolVersion(String),

    #[error("{0}")]
    InvalidContainerState(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}")]
    Cancelled(String),
}

impl HandlerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownMessageType(_) => ErrorKind::UnknownMessageType,
            Self::ProtocolVersion(_) => ErrorKind::ProtocolVersion,
            Self::InvalidContainerState(_) => ErrorKind::InvalidContainerState,
            Self::Runtime(_) => ErrorKind::RuntimeInvocation,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Internal(_) => ErrorKind::Internal,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn to_record(&self) -> ErrorRecord {
        match self {
            Self::Runtime(err) => ErrorRecord::new(
                ErrorKind::RuntimeInvocation,
                format!("runtime {} failed", err.operation()),
            )
            .with_cause(err.cause()),
            other => ErrorRecord::new(other.kind(), other.to_string()),
        }
    }
}

impl From<VersionViolation> for HandlerError {
    fn from(violation: VersionViolation) -> Self {
        Self::ProtocolVersion(violation.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("transport closed by host")]
    TransportClosed,
}
