//! Runtime adapter that drives the `runc` CLI.
//!
//! Each container gets a bundle directory under `bundle_root`:
//!
//! ```text
//! <bundle_root>/<id>/config.json         OCI spec from the create request
//! <bundle_root>/<id>/init.pid            written by `runc create`
//! <bundle_root>/<id>/runc.log            runc's JSON log, source of error causes
//! <bundle_root>/<id>/process-<n>.json    exec'd process specs
//! ```
//!
//! Containers are created detached, so their processes are reparented to the
//! agent. The agent must be a child subreaper for `wait` to reach them. The
//! init of a container deleted before `start` is never watched by the host, so
//! `delete` reaps it.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashSet;
use gcs_bridge::protocol::{ContainerSpec, ProcessSpec};
use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::process::Command;

use super::{Runtime, RuntimeError, send_signal, valid_container_id};

const LOG_FILE: &str = "runc.log";
const INIT_PID_FILE: &str = "init.pid";

#[derive(Debug, Clone)]
pub struct RuncConfig {
    pub binary: PathBuf,
    /// runc state directory (`--root`).
    pub root: PathBuf,
    pub bundle_root: PathBuf,
}

impl Default for RuncConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("runc"),
            root: PathBuf::from("/run/runc"),
            bundle_root: PathBuf::from("/run/gcs/c"),
        }
    }
}

pub struct RuncRuntime {
    config: RuncConfig,
    exec_counter: AtomicU64,
    /// Containers whose init was started and is therefore waited on by the host.
    started: DashSet<String>,
}

impl RuncRuntime {
    pub fn new(config: RuncConfig) -> Self {
        Self {
            config,
            exec_counter: AtomicU64::new(0),
            started: DashSet::new(),
        }
    }

    fn ensure_valid_id(operation: &'static str, id: &str) -> Result<(), RuntimeError> {
        if valid_container_id(id) {
            Ok(())
        } else {
            Err(RuntimeError::invocation(operation, format!("invalid container id {id:?}")))
        }
    }

    fn bundle_dir(&self, id: &str) -> PathBuf {
        self.config.bundle_root.join(id)
    }

    fn command(&self, id: &str) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("--root")
            .arg(&self.config.root)
            .arg("--log")
            .arg(self.bundle_dir(id).join(LOG_FILE))
            .arg("--log-format")
            .arg("json")
            .stdin(Stdio::null());
        cmd
    }

    /// Runs one runc invocation and returns its stdout.
    ///
    /// Container stdio for `create` and `exec` is inherited from runc, so those
    /// calls point stdout/stderr at files in the bundle before calling this.
    async fn run<I, S>(
        &self,
        operation: &'static str,
        id: &str,
        args: I,
        stdio: Option<(Stdio, Stdio)>,
    ) -> Result<Vec<u8>, RuntimeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let log_path = self.bundle_dir(id).join(LOG_FILE);
        let log_offset = tokio::fs::metadata(&log_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let mut cmd = self.command(id);
        cmd.args(args);
        tracing::debug!(operation, container_id = %id, command = ?cmd.as_std(), "Invoking runc");

        let (status, stdout, stderr) = match stdio {
            Some((out, err)) => {
                let status = cmd
                    .stdout(out)
                    .stderr(err)
                    .status()
                    .await
                    .map_err(|e| RuntimeError::invocation(operation, format!("failed to run runc: {e}")))?;
                (status, Vec::new(), Vec::new())
            }
            None => {
                let output = cmd
                    .output()
                    .await
                    .map_err(|e| RuntimeError::invocation(operation, format!("failed to run runc: {e}")))?;
                (output.status, output.stdout, output.stderr)
            }
        };

        if status.success() {
            return Ok(stdout);
        }

        let cause = match read_log_tail(&log_path, log_offset).await {
            Some(message) => message,
            None => {
                let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
                if stderr.is_empty() {
                    format!("runc {operation} exited with {status}")
                } else {
                    stderr
                }
            }
        };
        tracing::warn!(operation, container_id = %id, %cause, "runc invocation failed");
        Err(RuntimeError::invocation(operation, cause))
    }

    async fn read_pid_file(operation: &'static str, path: &Path) -> Result<u32, RuntimeError> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            RuntimeError::invocation(operation, format!("failed to read {}: {e}", path.display()))
        })?;
        contents.trim().parse().map_err(|e| {
            RuntimeError::invocation(operation, format!("invalid pid in {}: {e}", path.display()))
        })
    }

    async fn stdio_files(
        operation: &'static str,
        dir: &Path,
        prefix: &str,
    ) -> Result<(Stdio, Stdio), RuntimeError> {
        let stdout = log_file(operation, dir.join(format!("{prefix}.stdout.log"))).await?;
        let stderr = log_file(operation, dir.join(format!("{prefix}.stderr.log"))).await?;
        Ok((stdout, stderr))
    }
}

async fn log_file(operation: &'static str, path: PathBuf) -> Result<Stdio, RuntimeError> {
    let file = tokio::fs::File::create(&path).await.map_err(|e| {
        RuntimeError::invocation(operation, format!("failed to create {}: {e}", path.display()))
    })?;
    Ok(Stdio::from(file.into_std().await))
}

/// Last `error`-level message appended to a runc JSON log since `offset`.
async fn read_log_tail(path: &Path, offset: u64) -> Option<String> {
    let contents = tokio::fs::read(path).await.ok()?;
    let start = usize::try_from(offset).ok()?.min(contents.len());
    last_error_message(&String::from_utf8_lossy(&contents[start..]))
}

fn last_error_message(log: &str) -> Option<String> {
    log.lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter(|entry| entry.get("level").and_then(|l| l.as_str()) == Some("error"))
        .filter_map(|entry| entry.get("msg").and_then(|m| m.as_str()).map(str::to_string))
        .last()
}

fn exec_process_json(process: &ProcessSpec) -> serde_json::Value {
    let env = if process.env.is_empty() {
        vec!["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()]
    } else {
        process.env.clone()
    };
    serde_json::json!({
        "args": process.args,
        "env": env,
        "cwd": process.cwd.as_deref().unwrap_or("/"),
        "terminal": process.terminal,
        "user": {"uid": 0, "gid": 0},
    })
}

impl RuncRuntime {
    async fn create_bundle(&self, id: &str, dir: &Path, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let config = serde_json::to_vec_pretty(&spec.oci)
            .map_err(|e| RuntimeError::invocation("create", format!("failed to encode spec: {e}")))?;
        tokio::fs::write(dir.join("config.json"), config)
            .await
            .map_err(|e| RuntimeError::invocation("create", format!("failed to write config.json: {e}")))?;

        let pid_file = dir.join(INIT_PID_FILE);
        let stdio = Self::stdio_files("create", dir, "init").await?;
        self.run(
            "create",
            id,
            [
                OsStr::new("create"),
                OsStr::new("--bundle"),
                dir.as_os_str(),
                OsStr::new("--pid-file"),
                pid_file.as_os_str(),
                OsStr::new(id),
            ],
            Some(stdio),
        )
        .await?;
        Ok(())
    }

    /// Removes the bundle directory. Already gone is fine.
    async fn remove_bundle(&self, operation: &'static str, id: &str) -> Result<(), RuntimeError> {
        let dir = self.bundle_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RuntimeError::invocation(
                operation,
                format!("failed to remove bundle {}: {e}", dir.display()),
            )),
        }
    }
}

/// Collects a process that was never handed to `wait`. Blocks until it exits,
/// so the caller must have killed it already.
async fn reap(os_pid: u32) {
    let pid = Pid::from_raw(os_pid as i32);
    let reaped = tokio::task::spawn_blocking(move || loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => return Ok(()),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    })
    .await;
    match reaped {
        Ok(Ok(())) => tracing::debug!(os_pid, "Reaped unstarted init"),
        Ok(Err(e)) => tracing::warn!(os_pid, error = %e, "Failed to reap unstarted init"),
        Err(e) => tracing::warn!(os_pid, error = %e, "Reap task failed"),
    }
}

#[async_trait]
impl Runtime for RuncRuntime {
    async fn create(&self, id: &str, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        Self::ensure_valid_id("create", id)?;
        let dir = self.bundle_dir(id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            RuntimeError::invocation("create", format!("failed to create bundle {}: {e}", dir.display()))
        })?;

        let created = self.create_bundle(id, &dir, spec).await;
        if created.is_err()
            && let Err(e) = self.remove_bundle("create", id).await
        {
            tracing::warn!(container_id = %id, error = %e, "Failed to clean up bundle");
        }
        created
    }

    async fn start(&self, id: &str) -> Result<u32, RuntimeError> {
        self.run("start", id, ["start", id], None).await?;
        self.started.insert(id.to_string());
        Self::read_pid_file("start", &self.bundle_dir(id).join(INIT_PID_FILE)).await
    }

    async fn exec(&self, id: &str, process: &ProcessSpec) -> Result<u32, RuntimeError> {
        let dir = self.bundle_dir(id);
        let n = self.exec_counter.fetch_add(1, Ordering::Relaxed);
        let process_file = dir.join(format!("process-{n}.json"));
        let pid_file = dir.join(format!("process-{n}.pid"));

        let body = serde_json::to_vec(&exec_process_json(process))
            .map_err(|e| RuntimeError::invocation("exec", format!("failed to encode process: {e}")))?;
        tokio::fs::write(&process_file, body)
            .await
            .map_err(|e| RuntimeError::invocation("exec", format!("failed to write {}: {e}", process_file.display())))?;

        let stdio = Self::stdio_files("exec", &dir, &format!("process-{n}")).await?;
        self.run(
            "exec",
            id,
            [
                OsStr::new("exec"),
                OsStr::new("--detach"),
                OsStr::new("--pid-file"),
                pid_file.as_os_str(),
                OsStr::new("--process"),
                process_file.as_os_str(),
                OsStr::new(id),
            ],
            Some(stdio),
        )
        .await?;
        Self::read_pid_file("exec", &pid_file).await
    }

    async fn signal(&self, id: &str, os_pid: u32, signal: i32) -> Result<(), RuntimeError> {
        let init_pid = Self::read_pid_file("signal", &self.bundle_dir(id).join(INIT_PID_FILE))
            .await
            .ok();
        if init_pid == Some(os_pid) {
            let signal = signal.to_string();
            self.run("signal", id, ["kill", id, signal.as_str()], None).await?;
            return Ok(());
        }

        send_signal(os_pid, signal)
    }

    async fn wait(&self, _id: &str, os_pid: u32) -> Result<i32, RuntimeError> {
        let pid = Pid::from_raw(os_pid as i32);
        tokio::task::spawn_blocking(move || loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => return Err(RuntimeError::invocation("wait", format!("waitpid {os_pid}: {e}"))),
            }
        })
        .await
        .map_err(|e| RuntimeError::invocation("wait", format!("wait task failed: {e}")))?
    }

    async fn delete(&self, id: &str) -> Result<(), RuntimeError> {
        Self::ensure_valid_id("delete", id)?;
        let unstarted_init = if self.started.contains(id) {
            None
        } else {
            Self::read_pid_file("delete", &self.bundle_dir(id).join(INIT_PID_FILE))
                .await
                .ok()
        };

        self.run("delete", id, ["delete", "--force", id], None).await?;
        self.started.remove(id);
        if let Some(os_pid) = unstarted_init {
            reap(os_pid).await;
        }
        self.remove_bundle("delete", id).await
    }

    async fn pids(&self, id: &str) -> Result<Vec<u32>, RuntimeError> {
        let stdout = self.run("pids", id, ["ps", "--format", "json", id], None).await?;
        // runc prints `null` for a container without processes.
        let pids: Option<Vec<u32>> = serde_json::from_slice(&stdout)
            .map_err(|e| RuntimeError::invocation("pids", format!("invalid runc ps output: {e}")))?;
        Ok(pids.unwrap_or_default())
    }

    async fn properties(&self, id: &str) -> Result<serde_json::Value, RuntimeError> {
        let stdout = self.run("properties", id, ["state", id], None).await?;
        serde_json::from_slice(&stdout)
            .map_err(|e| RuntimeError::invocation("properties", format!("invalid runc state output: {e}")))
    }
}
