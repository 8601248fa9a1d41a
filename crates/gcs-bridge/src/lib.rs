//! Wire protocol between the host and the guest compute service.
//!
//! - [`codec`]: 12-byte header framing over any byte stream
//! - [`message`]: message types, categories and the typed [`Message`] view
//! - [`protocol`]: JSON payloads for every request, response and notification
//! - [`version`]: negotiated protocol levels and what they gate

pub mod codec;
pub mod error;
pub mod message;
pub mod protocol;
pub mod version;

pub use codec::{CodecError, Frame, FrameCodec, FrameError, MessageCodec};
pub use error::{ErrorKind, ErrorRecord};
pub use message::{
    Category, Message, MessageType, NOTIFICATION_ID, Notification, NotificationKind,
    ProtocolError, RequestKind, VersionViolation,
};
pub use protocol::{Request, Response, ResponseBody};
pub use version::ProtocolVersion;
