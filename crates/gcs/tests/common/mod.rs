//! Shared fixtures: a scripted runtime and a host-side peer over an
//! in-memory duplex stream.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use gcs::bridge::{Bridge, BridgeConfig, HandlerRegistry, Publisher};
use gcs::host::Host;
use gcs::runtime::{Runtime, RuntimeError};
use gcs::BridgeError;
use gcs_bridge::protocol::{
    ContainerRequest, ContainerSpec, CreateContainerRequest, ExecProcessRequest,
    GetPropertiesRequest, NegotiateProtocolRequest, ProcessExitNotification, ProcessSpec,
    PropertyQuery, RequestBase, ShutdownContainerRequest, WaitForProcessRequest,
};
use gcs_bridge::{Frame, FrameCodec, Message, Notification, ProtocolVersion, Request, Response};
use serde_json::json;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// First OS pid handed out by [`FakeRuntime`].
pub const FIRST_OS_PID: u32 = 1000;

/// Runtime double. Processes run until [`FakeRuntime::exit`] is called or
/// they receive SIGTERM/SIGKILL.
pub struct FakeRuntime {
    next_pid: AtomicU32,
    failures: Mutex<HashMap<&'static str, String>>,
    calls: Mutex<Vec<String>>,
    exits: DashMap<u32, watch::Sender<Option<i32>>>,
    pids: DashMap<String, Vec<u32>>,
    state: Mutex<serde_json::Value>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            next_pid: AtomicU32::new(FIRST_OS_PID),
            failures: Mutex::default(),
            calls: Mutex::default(),
            exits: DashMap::new(),
            pids: DashMap::new(),
            state: Mutex::new(json!({ "status": "running" })),
        }
    }
}

impl FakeRuntime {
    /// The next call of `operation` fails with `cause`.
    pub fn fail_next(&self, operation: &'static str, cause: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(operation, cause.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Replaces the document returned by `properties`.
    pub fn set_state(&self, state: serde_json::Value) {
        *self.state.lock().unwrap() = state;
    }

    /// Number of recorded calls to `operation`.
    pub fn count(&self, operation: &str) -> usize {
        let prefix = format!("{operation} ");
        self.calls().iter().filter(|call| call.starts_with(&prefix)).count()
    }

    pub fn exit(&self, os_pid: u32, code: i32) {
        if let Some(tx) = self.exits.get(&os_pid) {
            tx.send_replace(Some(code));
        }
    }

    fn call(&self, operation: &'static str, id: &str) -> Result<(), RuntimeError> {
        self.calls.lock().unwrap().push(format!("{operation} {id}"));
        match self.failures.lock().unwrap().remove(operation) {
            Some(cause) => Err(RuntimeError::invocation(operation, cause)),
            None => Ok(()),
        }
    }

    fn spawn(&self, id: &str) -> u32 {
        let os_pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (tx, _) = watch::channel(None);
        self.exits.insert(os_pid, tx);
        self.pids.entry(id.to_string()).or_default().push(os_pid);
        os_pid
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn create(&self, id: &str, _spec: &ContainerSpec) -> Result<(), RuntimeError> {
        self.call("create", id)
    }

    async fn start(&self, id: &str) -> Result<u32, RuntimeError> {
        self.call("start", id)?;
        Ok(self.spawn(id))
    }

    async fn exec(&self, id: &str, _process: &ProcessSpec) -> Result<u32, RuntimeError> {
        self.call("exec", id)?;
        Ok(self.spawn(id))
    }

    async fn signal(&self, id: &str, os_pid: u32, signal: i32) -> Result<(), RuntimeError> {
        self.call("signal", id)?;
        if signal == 9 || signal == 15 {
            self.exit(os_pid, 128 + signal);
        }
        Ok(())
    }

    async fn wait(&self, id: &str, os_pid: u32) -> Result<i32, RuntimeError> {
        self.call("wait", id)?;
        let mut rx = self
            .exits
            .get(&os_pid)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| RuntimeError::invocation("wait", format!("no such process {os_pid}")))?;
        let code = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|e| RuntimeError::invocation("wait", e.to_string()))?;
        Ok((*code).unwrap_or(-1))
    }

    async fn delete(&self, id: &str) -> Result<(), RuntimeError> {
        self.call("delete", id)?;
        self.pids.remove(id);
        Ok(())
    }

    async fn pids(&self, id: &str) -> Result<Vec<u32>, RuntimeError> {
        self.call("pids", id)?;
        Ok(self.pids.get(id).map(|pids| pids.value().clone()).unwrap_or_default())
    }

    async fn properties(&self, id: &str) -> Result<serde_json::Value, RuntimeError> {
        self.call("properties", id)?;
        Ok(self.state.lock().unwrap().clone())
    }
}

/// Host-side end of a served connection.
pub struct Harness {
    pub host: Arc<Host>,
    pub runtime: Arc<FakeRuntime>,
    writer: FramedWrite<WriteHalf<DuplexStream>, FrameCodec>,
    reader: FramedRead<ReadHalf<DuplexStream>, FrameCodec>,
    backlog: VecDeque<Frame>,
    server: JoinHandle<Result<(), BridgeError>>,
    next_id: u32,
}

impl Harness {
    pub fn new(max_version: ProtocolVersion) -> Self {
        Self::with_config(BridgeConfig {
            max_version,
            shutdown_grace: Duration::from_millis(100),
            ..Default::default()
        })
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let runtime = Arc::new(FakeRuntime::default());
        let publisher = Publisher::new();
        let host = Host::new(runtime.clone(), publisher.clone());
        let mut handlers = HandlerRegistry::builder();
        host.assign_handlers(&mut handlers);
        let bridge = Bridge::new(config, handlers.build(), publisher);

        let (agent, peer) = tokio::io::duplex(64 * 1024);
        let (agent_rx, agent_tx) = tokio::io::split(agent);
        let server = tokio::spawn(async move { bridge.serve(agent_rx, agent_tx).await });
        let (peer_rx, peer_tx) = tokio::io::split(peer);

        Self {
            host,
            runtime,
            writer: FramedWrite::new(peer_tx, FrameCodec::new()),
            reader: FramedRead::new(peer_rx, FrameCodec::new()),
            backlog: VecDeque::new(),
            server,
            next_id: 1,
        }
    }

    pub async fn send_raw(&mut self, frame: Frame) {
        self.writer.send(frame).await.unwrap();
    }

    /// Writes bytes past the codec.
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        let inner = self.writer.get_mut();
        inner.write_all(bytes).await.unwrap();
        inner.flush().await.unwrap();
    }

    pub async fn send_with_id(&mut self, id: u32, request: Request) {
        let frame = Message::Request { id, request }.to_frame().unwrap();
        self.send_raw(frame).await;
    }

    /// Sends with the next free id and returns it.
    pub async fn send(&mut self, request: Request) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.send_with_id(id, request).await;
        id
    }

    pub async fn call(&mut self, request: Request) -> Response {
        let id = self.send(request).await;
        self.response(id).await
    }

    pub async fn recv_frame(&mut self) -> Frame {
        if let Some(frame) = self.backlog.pop_front() {
            return frame;
        }
        self.read_frame().await
    }

    async fn read_frame(&mut self) -> Frame {
        tokio::time::timeout(TIMEOUT, self.reader.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("agent closed the connection")
            .expect("frame decode failed")
    }

    /// Next response for `id`. Other frames are kept for later.
    pub async fn response(&mut self, id: u32) -> Response {
        let frame = self.take_frame(|frame| frame.id == id && !is_notification(frame)).await;
        match Message::from_frame(&frame).unwrap() {
            Message::Response { response, .. } => response,
            other => panic!("expected response to {id}, got {other:?}"),
        }
    }

    pub async fn next_notification(&mut self) -> ProcessExitNotification {
        let frame = self.take_frame(is_notification).await;
        match Message::from_frame(&frame).unwrap() {
            Message::Notification(Notification::ProcessExit(exit)) => exit,
            other => panic!("expected notification, got {other:?}"),
        }
    }

    /// Fails if a notification arrives within `window`.
    pub async fn assert_no_notification(&mut self, window: Duration) {
        assert!(self.backlog.iter().all(|frame| !is_notification(frame)));
        while let Ok(next) = tokio::time::timeout(window, self.reader.next()).await {
            let frame = next.expect("agent closed the connection").unwrap();
            assert!(!is_notification(&frame), "unexpected notification {frame:?}");
            self.backlog.push_back(frame);
        }
    }

    async fn take_frame(&mut self, wanted: impl Fn(&Frame) -> bool) -> Frame {
        if let Some(index) = self.backlog.iter().position(&wanted) {
            if let Some(frame) = self.backlog.remove(index) {
                return frame;
            }
        }
        loop {
            let frame = self.read_frame().await;
            if wanted(&frame) {
                return frame;
            }
            self.backlog.push_back(frame);
        }
    }

    pub async fn negotiate(&mut self, version: ProtocolVersion) -> Response {
        self.call(Request::NegotiateProtocol(NegotiateProtocolRequest {
            requested_version: version.as_u32(),
            minimum_version: version.as_u32(),
        }))
        .await
    }

    /// Waits for the agent to stop serving.
    pub async fn join(self) -> Result<(), BridgeError> {
        tokio::time::timeout(TIMEOUT, self.server)
            .await
            .expect("bridge did not stop")
            .unwrap()
    }

    /// Closes the host side and waits for the agent to notice.
    pub async fn hang_up(self) -> Result<(), BridgeError> {
        let Harness {
            writer,
            reader,
            server,
            ..
        } = self;
        drop(writer);
        drop(reader);
        tokio::time::timeout(TIMEOUT, server)
            .await
            .expect("bridge did not stop")
            .unwrap()
    }
}

fn is_notification(frame: &Frame) -> bool {
    frame.message_type.category() == gcs_bridge::Category::Notification
}

pub fn create(id: &str) -> Request {
    Request::CreateContainer(CreateContainerRequest {
        base: RequestBase::default(),
        container_id: id.into(),
        spec: ContainerSpec::new(json!({ "process": { "args": ["/bin/sleep", "infinity"] } })),
        annotations: Default::default(),
    })
}

pub fn start(id: &str) -> Request {
    Request::StartContainer(target(id))
}

pub fn delete(id: &str) -> Request {
    Request::DeleteContainer(target(id))
}

pub fn shutdown_container(id: &str, force: bool) -> Request {
    Request::ShutdownContainer(ShutdownContainerRequest {
        base: RequestBase::default(),
        container_id: id.into(),
        force,
    })
}

pub fn exec(id: &str, cmd: &str) -> Request {
    Request::ExecProcess(ExecProcessRequest {
        base: RequestBase::default(),
        container_id: id.into(),
        process: ProcessSpec::new([cmd]),
    })
}

pub fn wait(id: &str, pid: u32) -> Request {
    Request::WaitForProcess(WaitForProcessRequest {
        base: RequestBase::default(),
        container_id: id.into(),
        pid,
    })
}

pub fn properties(id: &str, query: PropertyQuery) -> Request {
    Request::GetProperties(GetPropertiesRequest {
        base: RequestBase::default(),
        container_id: id.into(),
        query,
    })
}

fn target(id: &str) -> ContainerRequest {
    ContainerRequest {
        base: RequestBase::default(),
        container_id: id.into(),
    }
}
