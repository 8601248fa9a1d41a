//! Container and process records kept by the host registry.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use gcs_bridge::protocol::{
    ContainerProperties, ContainerStatus, ProcessDetails, ProcessStatus,
};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::HandlerError;

/// Container-scoped pid of the init process.
pub const INIT_PID: u32 = 0;

/// Lifecycle: `Created -> Running -> Stopped -> Deleted`. `Created` may also
/// go straight to `Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Stopped,
    Deleted,
}

impl ContainerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Deleted => "deleted",
        }
    }

    pub fn status(self) -> ContainerStatus {
        match self {
            Self::Created => ContainerStatus::Created,
            Self::Running => ContainerStatus::Running,
            Self::Stopped => ContainerStatus::Stopped,
            Self::Deleted => ContainerStatus::Deleted,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Running)
                | (Self::Created, Self::Deleted)
                | (Self::Running, Self::Stopped)
                | (Self::Running, Self::Deleted)
                | (Self::Stopped, Self::Deleted)
        )
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A process started inside a container. Its exit code is published once
/// through a watch channel so waiters never need the container lock.
#[derive(Debug)]
pub struct Process {
    pub pid: u32,
    pub os_pid: u32,
    exit: watch::Sender<Option<i32>>,
}

impl Process {
    pub fn new(pid: u32, os_pid: u32) -> Self {
        let (exit, _) = watch::channel(None);
        Self { pid, os_pid, exit }
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit_code().is_none()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<i32>> {
        self.exit.subscribe()
    }

    /// Returns false when the exit was already recorded.
    fn mark_exited(&self, code: i32) -> bool {
        self.exit.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(code);
            true
        })
    }

    fn details(&self) -> ProcessDetails {
        let exit_code = self.exit_code();
        ProcessDetails {
            pid: self.pid,
            state: if exit_code.is_some() {
                ProcessStatus::Exited
            } else {
                ProcessStatus::Running
            },
            exit_code,
        }
    }
}

#[derive(Debug)]
pub struct Container {
    pub id: String,
    state: ContainerState,
    processes: BTreeMap<u32, Process>,
    pub settings: BTreeMap<String, Value>,
    annotations: BTreeMap<String, String>,
    next_pid: u32,
    created_at: DateTime<Utc>,
}

impl Container {
    pub fn new(id: impl Into<String>, annotations: BTreeMap<String, String>) -> Self {
        Self {
            id: id.into(),
            state: ContainerState::Created,
            processes: BTreeMap::new(),
            settings: BTreeMap::new(),
            annotations,
            next_pid: INIT_PID + 1,
            created_at: Utc::now(),
        }
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    /// Fails with `InvalidContainerState` unless `self.state -> next` is legal.
    pub fn ensure_transition(&self, next: ContainerState) -> Result<(), HandlerError> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(HandlerError::InvalidContainerState(format!(
                "container {} is {}, cannot move to {}",
                self.id, self.state, next
            )))
        }
    }

    pub fn ensure_state(&self, expected: ContainerState) -> Result<(), HandlerError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HandlerError::InvalidContainerState(format!(
                "container {} is {}, expected {}",
                self.id, self.state, expected
            )))
        }
    }

    pub fn process(&self, pid: u32) -> Result<&Process, HandlerError> {
        self.processes.get(&pid).ok_or_else(|| {
            HandlerError::InvalidContainerState(format!(
                "process {pid} not found in container {}",
                self.id
            ))
        })
    }

    pub fn has_running_processes(&self) -> bool {
        self.processes.values().any(Process::is_running)
    }

    /// Registers the init process and moves to `Running`.
    pub fn mark_started(&mut self, os_pid: u32) {
        self.processes.insert(INIT_PID, Process::new(INIT_PID, os_pid));
        self.state = ContainerState::Running;
    }

    /// Allocates the next container-scoped pid for an exec'd process.
    pub fn add_process(&mut self, os_pid: u32) -> u32 {
        let pid = self.next_pid;
        self.next_pid += 1;
        self.processes.insert(pid, Process::new(pid, os_pid));
        pid
    }

    /// Running processes, init first.
    pub fn running_processes(&self) -> impl Iterator<Item = &Process> {
        self.processes.values().filter(|p| p.is_running())
    }

    /// Records a process exit. The container stops once its last running
    /// process has exited.
    ///
    /// Returns false if the process is unknown or already exited, in which
    /// case nothing changed and no notification is due.
    pub fn record_exit(&mut self, pid: u32, exit_code: i32) -> bool {
        let Some(process) = self.processes.get(&pid) else {
            return false;
        };
        if !process.mark_exited(exit_code) {
            return false;
        }
        if self.state == ContainerState::Running && !self.has_running_processes() {
            self.state = ContainerState::Stopped;
        }
        true
    }

    /// Tombstones the container. Process records are reaped.
    pub fn mark_deleted(&mut self) {
        self.processes.clear();
        self.state = ContainerState::Deleted;
    }

    pub fn properties(&self) -> ContainerProperties {
        ContainerProperties {
            container_id: self.id.clone(),
            state: self.state.status(),
            processes: self.processes.values().map(Process::details).collect(),
            settings: self.settings.clone(),
            annotations: self.annotations.clone(),
            created_at: Some(self.created_at.to_rfc3339()),
            runtime_pids: None,
            runtime_state: None,
        }
    }
}
