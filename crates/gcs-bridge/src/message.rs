//! Message types and the typed view of a frame.
//!
//! The 32-bit type field splits into a category nibble (bits 28-31) and a
//! 28-bit code. A response reuses the code of its request.

use std::fmt;

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::codec::Frame;
use crate::error::ErrorRecord;
use crate::protocol::{ProcessExitNotification, Request, Response};
use crate::version::ProtocolVersion;

/// Id carried by every notification.
pub const NOTIFICATION_ID: u32 = 0;

const CATEGORY_SHIFT: u32 = 28;
const CODE_MASK: u32 = 0x0fff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Request = 1,
    Response = 2,
    Notification = 3,
}

impl Category {
    fn from_nibble(nibble: u32) -> Option<Self> {
        match nibble {
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Notification),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    category: Category,
    code: u32,
}

impl MessageType {
    pub fn new(category: Category, code: u32) -> Self {
        Self {
            category,
            code: code & CODE_MASK,
        }
    }

    /// Splits a raw type field. `None` when the category nibble is unknown.
    pub fn from_raw(raw: u32) -> Option<Self> {
        let category = Category::from_nibble(raw >> CATEGORY_SHIFT)?;
        Some(Self::new(category, raw))
    }

    pub fn raw(self) -> u32 {
        ((self.category as u32) << CATEGORY_SHIFT) | self.code
    }

    pub fn category(self) -> Category {
        self.category
    }

    pub fn code(self) -> u32 {
        self.code
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.raw())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestKind {
    CreateContainer,
    StartContainer,
    ShutdownContainer,
    ExecProcess,
    WaitForProcess,
    SignalProcess,
    GetProperties,
    ModifySettings,
    NegotiateProtocol,
    DeleteContainer,
    Shutdown,
}

impl RequestKind {
    pub const ALL: [Self; 11] = [
        Self::CreateContainer,
        Self::StartContainer,
        Self::ShutdownContainer,
        Self::ExecProcess,
        Self::WaitForProcess,
        Self::SignalProcess,
        Self::GetProperties,
        Self::ModifySettings,
        Self::NegotiateProtocol,
        Self::DeleteContainer,
        Self::Shutdown,
    ];

    pub fn code(self) -> u32 {
        match self {
            Self::CreateContainer => 0x0010_0101,
            Self::StartContainer => 0x0010_0201,
            Self::ShutdownContainer => 0x0010_0301,
            Self::ExecProcess => 0x0010_0501,
            Self::WaitForProcess => 0x0010_0601,
            Self::SignalProcess => 0x0010_0701,
            Self::GetProperties => 0x0010_0901,
            Self::ModifySettings => 0x0010_0a01,
            Self::NegotiateProtocol => 0x0010_0b01,
            Self::DeleteContainer => 0x0010_0d01,
            Self::Shutdown => 0x0010_0f01,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    /// First protocol version in which this kind exists.
    pub fn min_version(self) -> ProtocolVersion {
        match self {
            Self::ModifySettings => ProtocolVersion::V3,
            Self::DeleteContainer => ProtocolVersion::V4,
            _ => ProtocolVersion::V2,
        }
    }

    pub fn request_type(self) -> MessageType {
        MessageType::new(Category::Request, self.code())
    }

    pub fn response_type(self) -> MessageType {
        MessageType::new(Category::Response, self.code())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateContainer => "CreateContainer",
            Self::StartContainer => "StartContainer",
            Self::ShutdownContainer => "ShutdownContainer",
            Self::ExecProcess => "ExecProcess",
            Self::WaitForProcess => "WaitForProcess",
            Self::SignalProcess => "SignalProcess",
            Self::GetProperties => "GetProperties",
            Self::ModifySettings => "ModifySettings",
            Self::NegotiateProtocol => "NegotiateProtocol",
            Self::DeleteContainer => "DeleteContainer",
            Self::Shutdown => "Shutdown",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    ProcessExit,
}

impl NotificationKind {
    pub fn code(self) -> u32 {
        match self {
            Self::ProcessExit => 0x0010_0101,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        (code == Self::ProcessExit.code()).then_some(Self::ProcessExit)
    }

    pub fn message_type(self) -> MessageType {
        MessageType::new(Category::Notification, self.code())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    ProcessExit(ProcessExitNotification),
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Self::ProcessExit(_) => NotificationKind::ProcessExit,
        }
    }
}

/// A request kind or field used under a version that predates it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{subject} requires protocol {required}, connection is at {negotiated}")]
pub struct VersionViolation {
    pub subject: String,
    pub required: ProtocolVersion,
    pub negotiated: ProtocolVersion,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownMessageType(MessageType),

    #[error("invalid payload for {message_type}: {source}")]
    InvalidPayload {
        message_type: MessageType,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {message_type}: {source}")]
    Encode {
        message_type: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

/// Typed frame. The id of a request is echoed by its response.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request { id: u32, request: Request },
    Response { id: u32, response: Response },
    Notification(Notification),
}

impl Message {
    pub fn id(&self) -> u32 {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => *id,
            Self::Notification(_) => NOTIFICATION_ID,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Request { request, .. } => request.kind().request_type(),
            Self::Response { response, .. } => response.kind.response_type(),
            Self::Notification(notification) => notification.kind().message_type(),
        }
    }

    /// Only requests are gated; responses and notifications are produced by
    /// the agent after the version is known.
    pub fn check_version(&self, version: ProtocolVersion) -> Result<(), VersionViolation> {
        match self {
            Self::Request { request, .. } => request.check_version(version),
            Self::Response { .. } | Self::Notification(_) => Ok(()),
        }
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let message_type = self.message_type();
        let payload = match self {
            Self::Request { request, .. } => request.encode_payload(),
            Self::Response { response, .. } => response.encode_payload(),
            Self::Notification(Notification::ProcessExit(exit)) => serde_json::to_vec(exit),
        }
        .map_err(|source| ProtocolError::Encode {
            message_type,
            source,
        })?;
        Ok(Frame::new(message_type, self.id(), payload))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let message_type = frame.message_type;
        let invalid = |source| ProtocolError::InvalidPayload {
            message_type,
            source,
        };
        match message_type.category() {
            Category::Request => {
                let kind = RequestKind::from_code(message_type.code())
                    .ok_or(ProtocolError::UnknownMessageType(message_type))?;
                let request = Request::decode(kind, &frame.payload).map_err(invalid)?;
                Ok(Self::Request {
                    id: frame.id,
                    request,
                })
            }
            Category::Response => {
                let kind = RequestKind::from_code(message_type.code())
                    .ok_or(ProtocolError::UnknownMessageType(message_type))?;
                let response = Response::decode(kind, &frame.payload).map_err(invalid)?;
                Ok(Self::Response {
                    id: frame.id,
                    response,
                })
            }
            Category::Notification => {
                match NotificationKind::from_code(message_type.code()) {
                    Some(NotificationKind::ProcessExit) => {
                        let exit = serde_json::from_slice(&frame.payload).map_err(invalid)?;
                        Ok(Self::Notification(Notification::ProcessExit(exit)))
                    }
                    None => Err(ProtocolError::UnknownMessageType(message_type)),
                }
            }
        }
    }
}

/// Error response for a request whose code has no [`RequestKind`].
///
/// The response reuses the unknown code so the host can still correlate it.
pub fn error_response_frame(
    code: u32,
    id: u32,
    record: &ErrorRecord,
) -> Result<Frame, ProtocolError> {
    let message_type = MessageType::new(Category::Response, code);
    let encode = |source| ProtocolError::Encode {
        message_type,
        source,
    };
    let mut object = Map::new();
    object.insert("result".to_string(), Value::from(record.result_code()));
    object.insert(
        "error".to_string(),
        serde_json::to_value(record).map_err(encode)?,
    );
    let payload = serde_json::to_vec(&Value::Object(object)).map_err(encode)?;
    Ok(Frame::new(message_type, id, Bytes::from(payload)))
}
