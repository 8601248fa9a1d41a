//! Host orchestrator: maps bridge requests onto container lifecycle actions.
//!
//! Commands run under their container's lock and only commit a transition
//! once the runtime has confirmed it. Process exits arrive asynchronously
//! from watcher tasks through a bounded inbox; the event loop applies them
//! to the registry and then publishes one notification per exit.

mod container;
mod registry;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use gcs_bridge::protocol::{
    ContainerRequest, ContainerStatus, CreateContainerRequest, ExecProcessRequest,
    ExecProcessResponse, GetPropertiesRequest, ModifyRequestType, ModifySettingsRequest,
    ProcessExitNotification, ShutdownContainerRequest, SignalProcessRequest,
    WaitForProcessRequest, WaitForProcessResponse,
};
use gcs_bridge::{Notification, Request, RequestKind, ResponseBody};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::bridge::{Handler, HandlerRegistryBuilder, Publisher, RequestContext};
use crate::error::HandlerError;
use crate::runtime::{Runtime, UNKNOWN_EXIT_CODE, valid_container_id};

pub use container::{Container, ContainerState, INIT_PID, Process};
pub use registry::{ContainerRef, ContainerRegistry, Reservation};

const EVENT_CAPACITY: usize = 256;

const SIGKILL: i32 = 9;
const SIGTERM: i32 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    ProcessExited {
        container_id: String,
        pid: u32,
        os_pid: u32,
        exit_code: i32,
    },
}

pub struct Host {
    runtime: Arc<dyn Runtime>,
    registry: ContainerRegistry,
    publisher: Publisher,
    events: mpsc::Sender<HostEvent>,
}

impl Host {
    /// Creates the host and spawns its event loop. Must be called inside a
    /// tokio runtime.
    pub fn new(runtime: Arc<dyn Runtime>, publisher: Publisher) -> Arc<Self> {
        let (events, inbox) = mpsc::channel(EVENT_CAPACITY);
        let host = Arc::new(Self {
            runtime,
            registry: ContainerRegistry::new(),
            publisher,
            events,
        });
        tokio::spawn(run_event_loop(Arc::downgrade(&host), inbox));
        host
    }

    /// Registers the host for every container and process request.
    pub fn assign_handlers(self: &Arc<Self>, builder: &mut HandlerRegistryBuilder) {
        let handler: Arc<dyn Handler> = Arc::new(HostHandler(Arc::clone(self)));
        for kind in RequestKind::ALL {
            if matches!(kind, RequestKind::NegotiateProtocol | RequestKind::Shutdown) {
                continue;
            }
            builder.register(kind, Arc::clone(&handler));
        }
    }

    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    pub async fn container_state(&self, id: &str) -> Option<ContainerState> {
        let container = self.registry.get(id)?;
        let state = container.lock().await.state();
        Some(state)
    }

    pub async fn create_container(&self, request: CreateContainerRequest) -> Result<ResponseBody, HandlerError> {
        let id = request.container_id;
        if !valid_container_id(&id) {
            return Err(HandlerError::InvalidRequest(format!("invalid container id {id:?}")));
        }
        let reservation = self.registry.reserve(&id).await?;
        self.runtime.create(&id, &request.spec).await?;
        reservation.commit(Container::new(id.as_str(), request.annotations));
        tracing::info!(container_id = %id, "Container created");
        Ok(ResponseBody::Empty)
    }

    pub async fn start_container(&self, request: ContainerRequest) -> Result<ResponseBody, HandlerError> {
        let id = request.container_id;
        let container = self.registry.container(&id)?;
        let mut guard = container.lock().await;
        guard.ensure_transition(ContainerState::Running)?;
        let os_pid = self.runtime.start(&id).await?;
        guard.mark_started(os_pid);
        drop(guard);

        tracing::info!(container_id = %id, os_pid, "Container started");
        self.watch_process(&id, INIT_PID, os_pid);
        Ok(ResponseBody::Empty)
    }

    /// Signals every running process, init first, and waits for all of them
    /// to exit. A stopped container is left alone.
    pub async fn shutdown_container(
        &self,
        request: ShutdownContainerRequest,
    ) -> Result<ResponseBody, HandlerError> {
        let id = request.container_id;
        let container = self.registry.container(&id)?;
        let targets: Vec<_> = {
            let guard = container.lock().await;
            match guard.state() {
                ContainerState::Stopped => return Ok(ResponseBody::Empty),
                ContainerState::Running => {}
                state => {
                    return Err(HandlerError::InvalidContainerState(format!(
                        "container {id} is {state}, cannot shut down"
                    )));
                }
            }
            guard
                .running_processes()
                .map(|p| (p.pid, p.os_pid, p.subscribe()))
                .collect()
        };

        let signal = if request.force { SIGKILL } else { SIGTERM };
        tracing::info!(container_id = %id, signal, processes = targets.len(), "Shutting down container");
        for (pid, os_pid, exit) in &targets {
            if let Err(e) = self.runtime.signal(&id, *os_pid, signal).await {
                // The process may have exited between the state check and the signal.
                if exit.borrow().is_none() {
                    return Err(e.into());
                }
                tracing::debug!(container_id = %id, pid, error = %e, "Signal failed after process exited");
            }
        }

        for (_, _, mut exit) in targets {
            exit.wait_for(Option::is_some).await.map_err(|_| {
                HandlerError::Internal(format!("container {id} was reaped during shutdown"))
            })?;
        }
        Ok(ResponseBody::Empty)
    }

    pub async fn exec_process(&self, request: ExecProcessRequest) -> Result<ResponseBody, HandlerError> {
        if request.process.args.is_empty() {
            return Err(HandlerError::InvalidRequest("process args must not be empty".into()));
        }
        let id = request.container_id;
        let container = self.registry.container(&id)?;
        let mut guard = container.lock().await;
        guard.ensure_state(ContainerState::Running)?;
        let os_pid = self.runtime.exec(&id, &request.process).await?;
        let pid = guard.add_process(os_pid);
        drop(guard);

        tracing::info!(container_id = %id, pid, os_pid, "Process started");
        self.watch_process(&id, pid, os_pid);
        Ok(ResponseBody::Exec(ExecProcessResponse { pid }))
    }

    pub async fn signal_process(&self, request: SignalProcessRequest) -> Result<ResponseBody, HandlerError> {
        if request.signal < 0 {
            return Err(HandlerError::InvalidRequest(format!(
                "invalid signal {}",
                request.signal
            )));
        }
        let id = request.container_id;
        let os_pid = {
            let container = self.registry.container(&id)?;
            let guard = container.lock().await;
            let process = guard.process(request.pid)?;
            if !process.is_running() {
                return Err(HandlerError::InvalidContainerState(format!(
                    "process {} in container {id} has exited",
                    request.pid
                )));
            }
            process.os_pid
        };
        self.runtime.signal(&id, os_pid, request.signal).await?;
        tracing::debug!(container_id = %id, pid = request.pid, signal = request.signal, "Process signalled");
        Ok(ResponseBody::Empty)
    }

    /// Resolves with the exit code, immediately if the process already exited.
    pub async fn wait_for_process(
        &self,
        request: WaitForProcessRequest,
    ) -> Result<ResponseBody, HandlerError> {
        let id = request.container_id;
        let pid = request.pid;
        let mut exit = {
            let container = self.registry.container(&id)?;
            let guard = container.lock().await;
            guard.process(pid)?.subscribe()
        };
        let exit_code = exit
            .wait_for(Option::is_some)
            .await
            .map(|code| *code)
            .ok()
            .flatten()
            .ok_or_else(|| {
                HandlerError::InvalidContainerState(format!(
                    "process {pid} in container {id} was reaped before it exited"
                ))
            })?;
        Ok(ResponseBody::Wait(WaitForProcessResponse { exit_code }))
    }

    pub async fn get_properties(&self, request: GetPropertiesRequest) -> Result<ResponseBody, HandlerError> {
        let id = request.container_id;
        let container = self.registry.container(&id)?;
        let mut properties = container.lock().await.properties();

        if properties.state != ContainerStatus::Deleted {
            if request.query.process_list {
                properties.runtime_pids = Some(self.runtime.pids(&id).await?);
            }
            if request.query.runtime_state {
                // A `null` state is reported as absent.
                let state = self.runtime.properties(&id).await?;
                properties.runtime_state = (!state.is_null()).then_some(state);
            }
        }
        Ok(ResponseBody::Properties(properties))
    }

    pub async fn modify_settings(
        &self,
        request: ModifySettingsRequest,
    ) -> Result<ResponseBody, HandlerError> {
        let id = request.container_id;
        let key = request.key;
        let container = self.registry.container(&id)?;
        let mut guard = container.lock().await;
        if guard.state() == ContainerState::Deleted {
            return Err(HandlerError::InvalidContainerState(format!(
                "container {id} is deleted"
            )));
        }

        let missing = || HandlerError::InvalidRequest(format!("setting {key} is not set on container {id}"));
        match request.request_type {
            ModifyRequestType::Add => {
                if guard.settings.contains_key(&key) {
                    return Err(HandlerError::InvalidRequest(format!(
                        "setting {key} already exists on container {id}"
                    )));
                }
                guard.settings.insert(key.clone(), request.value);
            }
            ModifyRequestType::Update => {
                let slot = guard.settings.get_mut(&key).ok_or_else(missing)?;
                *slot = request.value;
            }
            ModifyRequestType::Remove => {
                guard.settings.remove(&key).ok_or_else(missing)?;
            }
        }
        tracing::debug!(container_id = %id, %key, request_type = ?request.request_type, "Settings modified");
        Ok(ResponseBody::Empty)
    }

    /// Deletes the container, keeping a `Deleted` tombstone. Repeat deletes succeed.
    pub async fn delete_container(&self, request: ContainerRequest) -> Result<ResponseBody, HandlerError> {
        let id = request.container_id;
        let container = self.registry.container(&id)?;
        let mut guard = container.lock().await;
        if guard.state() == ContainerState::Deleted {
            return Ok(ResponseBody::Empty);
        }
        guard.ensure_transition(ContainerState::Deleted)?;
        if guard.has_running_processes() {
            return Err(HandlerError::InvalidContainerState(format!(
                "container {id} still has running processes"
            )));
        }
        self.runtime.delete(&id).await?;
        guard.mark_deleted();
        tracing::info!(container_id = %id, "Container deleted");
        Ok(ResponseBody::Empty)
    }

    fn watch_process(&self, container_id: &str, pid: u32, os_pid: u32) {
        let runtime = Arc::clone(&self.runtime);
        let events = self.events.clone();
        let container_id = container_id.to_string();
        let span = tracing::debug_span!("watch_process", %container_id, pid, os_pid);
        tokio::spawn(
            async move {
                let exit_code = match runtime.wait(&container_id, os_pid).await {
                    Ok(code) => code,
                    Err(e) => {
                        tracing::warn!(error = %e, "Wait failed, reporting unknown exit code");
                        UNKNOWN_EXIT_CODE
                    }
                };
                let event = HostEvent::ProcessExited {
                    container_id,
                    pid,
                    os_pid,
                    exit_code,
                };
                if events.send(event).await.is_err() {
                    tracing::debug!("Host event loop gone, dropping exit");
                }
            }
            .instrument(span),
        );
    }

    async fn apply(&self, event: HostEvent) {
        match event {
            HostEvent::ProcessExited {
                container_id,
                pid,
                os_pid,
                exit_code,
            } => self.process_exited(container_id, pid, os_pid, exit_code).await,
        }
    }

    async fn process_exited(&self, container_id: String, pid: u32, os_pid: u32, exit_code: i32) {
        let Some(container) = self.registry.get(&container_id) else {
            tracing::debug!(%container_id, pid, "Exit for unknown container");
            return;
        };
        let recorded = {
            let mut guard = container.lock().await;
            // A replaced tombstone reuses the id; only the process we watched counts.
            let same_process = guard.process(pid).is_ok_and(|p| p.os_pid == os_pid);
            same_process && guard.record_exit(pid, exit_code)
        };
        if !recorded {
            tracing::debug!(%container_id, pid, "Ignoring stale process exit");
            return;
        }

        tracing::info!(%container_id, pid, exit_code, "Process exited");
        let notification = Notification::ProcessExit(ProcessExitNotification {
            container_id,
            pid,
            exit_code,
        });
        if let Err(e) = self.publisher.notify(notification).await {
            tracing::warn!(error = %e, "Failed to publish process exit");
        }
    }
}

async fn run_event_loop(host: Weak<Host>, mut inbox: mpsc::Receiver<HostEvent>) {
    while let Some(event) = inbox.recv().await {
        let Some(host) = host.upgrade() else {
            break;
        };
        tokio::spawn(async move { host.apply(event).await });
    }
    tracing::debug!("Host event loop exiting");
}

struct HostHandler(Arc<Host>);

#[async_trait]
impl Handler for HostHandler {
    async fn handle(&self, _ctx: RequestContext, request: Request) -> Result<ResponseBody, HandlerError> {
        let host = &self.0;
        match request {
            Request::CreateContainer(r) => host.create_container(r).await,
            Request::StartContainer(r) => host.start_container(r).await,
            Request::ShutdownContainer(r) => host.shutdown_container(r).await,
            Request::ExecProcess(r) => host.exec_process(r).await,
            Request::WaitForProcess(r) => host.wait_for_process(r).await,
            Request::SignalProcess(r) => host.signal_process(r).await,
            Request::GetProperties(r) => host.get_properties(r).await,
            Request::ModifySettings(r) => host.modify_settings(r).await,
            Request::DeleteContainer(r) => host.delete_container(r).await,
            other @ (Request::NegotiateProtocol(_) | Request::Shutdown(_)) => Err(
                HandlerError::Internal(format!("{} is handled by the bridge", other.kind())),
            ),
        }
    }
}
