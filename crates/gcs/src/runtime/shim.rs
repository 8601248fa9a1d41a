//! In-process runtime that spawns container processes directly.
//!
//! No isolation: the "container" is a recorded spec plus the processes
//! started for it. Used for development hosts and for exercising the agent
//! without an OCI runtime installed.

use std::collections::BTreeSet;
use std::process::Stdio;

use async_trait::async_trait;
use dashmap::DashMap;
use gcs_bridge::protocol::{ContainerSpec, ProcessSpec};
use tokio::process::Command;
use tokio::sync::watch;

use super::{Runtime, RuntimeError, UNKNOWN_EXIT_CODE, exit_code, send_signal};

struct ShimContainer {
    spec: ContainerSpec,
    init_pid: Option<u32>,
    pids: BTreeSet<u32>,
}

#[derive(Default)]
pub struct ProcessShim {
    containers: DashMap<String, ShimContainer>,
    exits: DashMap<u32, watch::Receiver<Option<i32>>>,
}

impl ProcessShim {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn(&self, operation: &'static str, process: &ProcessSpec) -> Result<u32, RuntimeError> {
        let (program, args) = process
            .args
            .split_first()
            .ok_or_else(|| RuntimeError::invocation(operation, "process has no args"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if !process.env.is_empty() {
            command.env_clear();
            command.envs(process.env.iter().filter_map(|entry| entry.split_once('=')));
        }
        if let Some(ref cwd) = process.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| RuntimeError::invocation(operation, format!("{program}: {e}")))?;
        let os_pid = child
            .id()
            .ok_or_else(|| RuntimeError::invocation(operation, "child exited before reporting a pid"))?;

        let (tx, rx) = watch::channel(None);
        self.exits.insert(os_pid, rx);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::warn!(os_pid, error = %e, "Failed to wait on shim process");
                    UNKNOWN_EXIT_CODE
                }
            };
            let _ = tx.send(Some(code));
        });

        tracing::debug!(os_pid, program = %program, "Spawned shim process");
        Ok(os_pid)
    }

    fn has_exited(&self, os_pid: u32) -> bool {
        self.exits
            .get(&os_pid)
            .map(|rx| rx.borrow().is_some())
            .unwrap_or(true)
    }

    fn missing(operation: &'static str, id: &str) -> RuntimeError {
        RuntimeError::invocation(operation, format!("container {id} does not exist"))
    }
}

#[async_trait]
impl Runtime for ProcessShim {
    async fn create(&self, id: &str, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        if self.containers.contains_key(id) {
            return Err(RuntimeError::invocation(
                "create",
                format!("container {id} already exists"),
            ));
        }
        self.containers.insert(
            id.to_string(),
            ShimContainer {
                spec: spec.clone(),
                init_pid: None,
                pids: BTreeSet::new(),
            },
        );
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<u32, RuntimeError> {
        let process = {
            let container = self
                .containers
                .get(id)
                .ok_or_else(|| Self::missing("start", id))?;
            if container.init_pid.is_some() {
                return Err(RuntimeError::invocation(
                    "start",
                    format!("container {id} already started"),
                ));
            }
            container
                .spec
                .init_process()
                .ok_or_else(|| RuntimeError::invocation("start", "spec has no process"))?
        };

        let os_pid = self.spawn("start", &process)?;
        if let Some(mut container) = self.containers.get_mut(id) {
            container.init_pid = Some(os_pid);
            container.pids.insert(os_pid);
        }
        Ok(os_pid)
    }

    async fn exec(&self, id: &str, process: &ProcessSpec) -> Result<u32, RuntimeError> {
        if !self.containers.contains_key(id) {
            return Err(Self::missing("exec", id));
        }
        let os_pid = self.spawn("exec", process)?;
        if let Some(mut container) = self.containers.get_mut(id) {
            container.pids.insert(os_pid);
        }
        Ok(os_pid)
    }

    async fn signal(&self, id: &str, os_pid: u32, signal: i32) -> Result<(), RuntimeError> {
        let owned = self
            .containers
            .get(id)
            .map(|c| c.pids.contains(&os_pid))
            .ok_or_else(|| Self::missing("signal", id))?;
        if !owned {
            return Err(RuntimeError::invocation(
                "signal",
                format!("process {os_pid} does not belong to container {id}"),
            ));
        }
        send_signal(os_pid, signal)
    }

    async fn wait(&self, _id: &str, os_pid: u32) -> Result<i32, RuntimeError> {
        let mut rx = self
            .exits
            .get(&os_pid)
            .map(|rx| rx.clone())
            .ok_or_else(|| RuntimeError::invocation("wait", format!("unknown process {os_pid}")))?;
        let code = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RuntimeError::invocation("wait", "process watcher went away"))?;
        Ok((*code).unwrap_or(UNKNOWN_EXIT_CODE))
    }

    async fn delete(&self, id: &str) -> Result<(), RuntimeError> {
        let (_, container) = self
            .containers
            .remove(id)
            .ok_or_else(|| Self::missing("delete", id))?;
        for os_pid in container.pids {
            self.exits.remove(&os_pid);
        }
        Ok(())
    }

    async fn pids(&self, id: &str) -> Result<Vec<u32>, RuntimeError> {
        let pids: Vec<u32> = self
            .containers
            .get(id)
            .ok_or_else(|| Self::missing("pids", id))?
            .pids
            .iter()
            .copied()
            .collect();
        Ok(pids.into_iter().filter(|pid| !self.has_exited(*pid)).collect())
    }

    async fn properties(&self, id: &str) -> Result<serde_json::Value, RuntimeError> {
        let init_pid = self
            .containers
            .get(id)
            .ok_or_else(|| Self::missing("properties", id))?
            .init_pid;
        let status = match init_pid {
            None => "created",
            Some(pid) if self.has_exited(pid) => "stopped",
            Some(_) => "running",
        };
        Ok(serde_json::json!({
            "id": id,
            "runtime": "shim",
            "status": status,
            "pid": init_pid,
        }))
    }
}
