//! Byte transports the bridge can run over.
//!
//! In a utility VM the agent dials the host over vsock; for development and
//! tests it can bridge over its own stdin/stdout.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Well-known vsock context id of the hypervisor host.
pub const HOST_CID: u32 = 2;

/// Host port the command channel is dialed on.
pub const DEFAULT_COMMAND_PORT: u32 = 0x4000_0000;

/// The agent's own stdin and stdout. Logs must not go to stdout in this mode.
pub fn stdio() -> (BoxReader, BoxWriter) {
    (Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout()))
}

#[cfg(target_os = "linux")]
pub async fn dial_vsock(port: u32) -> io::Result<(BoxReader, BoxWriter)> {
    use tokio_vsock::{VsockAddr, VsockStream};

    tracing::info!(cid = HOST_CID, port, "Dialing host over vsock");
    let stream = VsockStream::connect(VsockAddr::new(HOST_CID, port)).await?;
    let (reader, writer) = tokio::io::split(stream);
    Ok((Box::new(reader), Box::new(writer)))
}

#[cfg(not(target_os = "linux"))]
pub async fn dial_vsock(port: u32) -> io::Result<(BoxReader, BoxWriter)> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("vsock port {port}: vsock is only available on linux"),
    ))
}
