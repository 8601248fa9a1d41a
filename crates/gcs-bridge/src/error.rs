//! Structured error records carried inside error responses.

use serde::{Deserialize, Serialize};

/// Error categories the host can act on.
///
/// Frame errors are absent on purpose: they tear the connection down and
/// never produce a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UnknownMessageType,
    #[serde(rename = "ProtocolVersionError")]
    ProtocolVersion,
    InvalidContainerState,
    #[serde(rename = "RuntimeInvocationError")]
    RuntimeInvocation,
    InvalidRequest,
    #[serde(rename = "InternalError")]
    Internal,
    Cancelled,
}

impl ErrorKind {
    /// HRESULT-style code placed in the response `result` field.
    pub fn result_code(self) -> i32 {
        let code: u32 = match self {
            // E_NOTIMPL
            Self::UnknownMessageType => 0x8000_4001,
            // HRESULT_FROM_WIN32(ERROR_NOT_SUPPORTED)
            Self::ProtocolVersion => 0x8007_0032,
            // HCS_E_INVALID_STATE
            Self::InvalidContainerState => 0x8037_0105,
            // E_FAIL
            Self::RuntimeInvocation => 0x8000_4005,
            // E_INVALIDARG
            Self::InvalidRequest => 0x8007_0057,
            // E_UNEXPECTED
            Self::Internal => 0x8000_FFFF,
            // E_ABORT
            Self::Cancelled => 0x8000_4004,
        };
        code as i32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownMessageType => "UnknownMessageType",
            Self::ProtocolVersion => "ProtocolVersionError",
            Self::InvalidContainerState => "InvalidContainerState",
            Self::RuntimeInvocation => "RuntimeInvocationError",
            Self::InvalidRequest => "InvalidRequest",
            Self::Internal => "InternalError",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    /// Diagnostic output of the external runtime, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn result_code(&self) -> i32 {
        self.kind.result_code()
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(ref cause) = self.cause {
            write!(f, " ({})", cause)?;
        }
        Ok(())
    }
}
