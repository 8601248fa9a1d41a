//! Runtime adapter: the contract between the host orchestrator and an
//! OCI-compatible container runtime.
//!
//! Adapters own no agent state. The host decides which transitions are legal
//! and only calls an adapter once a transition has been validated.

mod shim;

#[cfg(unix)]
mod runc;

use async_trait::async_trait;
use gcs_bridge::protocol::{ContainerSpec, ProcessSpec};

pub use shim::ProcessShim;

#[cfg(unix)]
pub use runc::{RuncConfig, RuncRuntime};

/// Exit code reported when a process could not be waited on.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime {operation} failed: {cause}")]
    Invocation {
        operation: &'static str,
        /// Diagnostic text of the external runtime, verbatim.
        cause: String,
    },
}

impl RuntimeError {
    pub fn invocation(operation: &'static str, cause: impl Into<String>) -> Self {
        Self::Invocation {
            operation,
            cause: cause.into(),
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            Self::Invocation { operation, .. } => operation,
        }
    }

    pub fn cause(&self) -> &str {
        match self {
            Self::Invocation { cause, .. } => cause,
        }
    }
}

/// Operations the host needs from a container runtime.
///
/// Pids passed to and returned from the runtime are OS pids. Container-scoped
/// pids are a host concept.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn create(&self, id: &str, spec: &ContainerSpec) -> Result<(), RuntimeError>;

    /// Starts the init process and returns its OS pid.
    async fn start(&self, id: &str) -> Result<u32, RuntimeError>;

    async fn exec(&self, id: &str, process: &ProcessSpec) -> Result<u32, RuntimeError>;

    async fn signal(&self, id: &str, os_pid: u32, signal: i32) -> Result<(), RuntimeError>;

    /// Resolves when the process exits. Signalled processes report `128 + signal`.
    async fn wait(&self, id: &str, os_pid: u32) -> Result<i32, RuntimeError>;

    async fn delete(&self, id: &str) -> Result<(), RuntimeError>;

    async fn pids(&self, id: &str) -> Result<Vec<u32>, RuntimeError>;

    /// Runtime-specific state document.
    async fn properties(&self, id: &str) -> Result<serde_json::Value, RuntimeError>;
}

/// Whether `id` can name a container: it becomes a bundle directory name and a
/// runtime argument, so only `[A-Za-z0-9_+.-]` is allowed, without a leading
/// `-` and never `.` or `..`.
pub fn valid_container_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.starts_with('-')
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'+' | b'-' | b'.'))
}

/// Maps a child's exit status onto the wire exit code.
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    UNKNOWN_EXIT_CODE
}

/// Sends `signal` to an OS pid. Signal 0 only probes the process.
#[cfg(unix)]
pub(crate) fn send_signal(os_pid: u32, signal: i32) -> Result<(), RuntimeError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let signal = match signal {
        0 => None,
        n => Some(
            Signal::try_from(n)
                .map_err(|e| RuntimeError::invocation("signal", format!("signal {n}: {e}")))?,
        ),
    };
    kill(Pid::from_raw(os_pid as i32), signal)
        .map_err(|e| RuntimeError::invocation("signal", format!("kill {os_pid}: {e}")))
}

#[cfg(not(unix))]
pub(crate) fn send_signal(_os_pid: u32, _signal: i32) -> Result<(), RuntimeError> {
    Err(RuntimeError::invocation(
        "signal",
        "signals are not supported on this platform",
    ))
}
