//! Request/response multiplexer over one duplex stream.
//!
//! Flow per connection:
//! 1. Attach the write half to the [`Publisher`]
//! 2. Decode frames in order; every dispatched request runs as its own task
//! 3. Negotiation and shutdown are answered by the read loop itself
//! 4. On shutdown: grace period, then cancel whatever is still pending
//! 5. On EOF or a frame error: mark the transport dead, cancel without writing

mod handler;
mod publisher;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use gcs_bridge::codec::DEFAULT_MAX_PAYLOAD;
use gcs_bridge::message::error_response_frame;
use gcs_bridge::protocol::{Capabilities, NegotiateProtocolRequest, NegotiateProtocolResponse};
use gcs_bridge::{
    Category, ErrorKind, ErrorRecord, Frame, FrameCodec, ProtocolVersion, Request, RequestKind,
    Response, ResponseBody,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::codec::FramedRead;
use tracing::Instrument;

use crate::error::{BridgeError, HandlerError};
use crate::version::GCS_VERSION;

pub use handler::{Handler, HandlerRegistry, HandlerRegistryBuilder, RequestContext};
pub use publisher::{PublishError, Publisher};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Highest version offered during negotiation.
    pub max_version: ProtocolVersion,
    /// How long in-flight handlers may run after a `Shutdown` request.
    pub shutdown_grace: Duration,
    pub max_payload: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_version: ProtocolVersion::V3,
            shutdown_grace: Duration::from_secs(5),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// A dispatched request that has not been answered yet.
#[derive(Debug)]
struct PendingRequest {
    id: u32,
    kind: RequestKind,
    activity_id: Option<String>,
    submitted_at: Instant,
    abort: AbortHandle,
}

/// Per-connection state shared between the read loop and handler tasks.
#[derive(Default)]
struct Connection {
    version: OnceLock<ProtocolVersion>,
    pending: Mutex<HashMap<u32, PendingRequest>>,
}

impl Connection {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u32, PendingRequest>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Pending request table poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Removes the entry for `id`. Whoever gets it owns the response.
    fn take_pending(&self, id: u32) -> Option<PendingRequest> {
        self.lock_pending().remove(&id)
    }

    /// Negotiated version, pinning the legacy version if none was negotiated.
    fn version(&self) -> ProtocolVersion {
        *self.version.get_or_init(|| {
            tracing::debug!(version = %ProtocolVersion::LEGACY, "No negotiation, using legacy protocol");
            ProtocolVersion::LEGACY
        })
    }
}

enum Flow {
    Continue,
    Shutdown,
}

pub struct Bridge {
    config: BridgeConfig,
    handlers: Arc<HandlerRegistry>,
    publisher: Publisher,
}

impl Bridge {
    pub fn new(config: BridgeConfig, handlers: HandlerRegistry, publisher: Publisher) -> Self {
        Self {
            config,
            handlers: Arc::new(handlers),
            publisher,
        }
    }

    /// Serves one connection until the host sends `Shutdown` (`Ok`) or the
    /// transport fails (`Err`).
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<(), BridgeError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let codec = FrameCodec::with_max_payload(self.config.max_payload);
        self.publisher.attach(writer, codec.clone()).await;
        let mut frames = FramedRead::new(reader, codec);
        let connection = Arc::new(Connection::default());
        let mut tasks = JoinSet::new();

        tracing::info!(max_version = %self.config.max_version, "Bridge serving");

        let outcome = loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => {
                        if let Flow::Shutdown = self.route(frame, &connection, &mut tasks).await {
                            break Ok(());
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Frame error, closing connection");
                        break Err(BridgeError::Frame(e));
                    }
                    None => {
                        tracing::warn!("Transport closed by host");
                        break Err(BridgeError::TransportClosed);
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined
                        && !e.is_cancelled()
                    {
                        tracing::error!(error = %e, "Request task failed");
                    }
                }
            }
        };

        match outcome {
            Ok(()) => {
                self.drain(&connection, &mut tasks).await;
                self.publisher.close().await;
                tracing::info!("Bridge shut down");
            }
            Err(_) => {
                self.publisher.mark_dead().await;
                self.cancel_pending(&connection, false).await;
            }
        }
        tasks.shutdown().await;
        outcome
    }

    async fn drain(&self, connection: &Connection, tasks: &mut JoinSet<()>) {
        let grace = self.config.shutdown_grace;
        let finished = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "Shutdown grace period elapsed with requests in flight");
        }
        self.cancel_pending(connection, true).await;
    }

    /// Removes every pending entry, aborts its task, and answers it with
    /// `Cancelled` when `write` is set.
    async fn cancel_pending(&self, connection: &Connection, write: bool) {
        let drained: Vec<PendingRequest> = connection
            .lock_pending()
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        for pending in &drained {
            pending.abort.abort();
        }
        if drained.is_empty() {
            return;
        }
        tracing::info!(count = drained.len(), write, "Cancelling pending requests");
        if !write {
            return;
        }
        for pending in drained {
            tracing::debug!(
                id = pending.id,
                kind = %pending.kind,
                elapsed_ms = pending.submitted_at.elapsed().as_millis() as u64,
                "Request cancelled"
            );
            let record = ErrorRecord::new(ErrorKind::Cancelled, "request cancelled by agent shutdown");
            let response = Response::failure(pending.kind, record).with_activity_id(pending.activity_id);
            if let Err(e) = self.publisher.respond(pending.id, response).await {
                tracing::debug!(id = pending.id, error = %e, "Could not deliver cancellation");
            }
        }
    }

    async fn route(
        &self,
        frame: Frame,
        connection: &Arc<Connection>,
        tasks: &mut JoinSet<()>,
    ) -> Flow {
        let message_type = frame.message_type;
        let id = frame.id;
        if message_type.category() != Category::Request {
            tracing::warn!(%message_type, id, "Ignoring unexpected inbound frame");
            return Flow::Continue;
        }

        let Some(kind) = RequestKind::from_code(message_type.code()) else {
            tracing::warn!(%message_type, id, "Unknown message type");
            let record = HandlerError::UnknownMessageType(message_type.raw()).to_record();
            match error_response_frame(message_type.code(), id, &record) {
                Ok(frame) => self.write_frame(frame).await,
                Err(e) => tracing::error!(error = %e, "Failed to encode error response"),
            }
            return Flow::Continue;
        };

        let request = match Request::decode(kind, &frame.payload) {
            Ok(request) => request,
            Err(e) => {
                let err = HandlerError::InvalidRequest(format!("invalid {kind} payload: {e}"));
                self.reply(id, Response::failure(kind, err.to_record())).await;
                return Flow::Continue;
            }
        };

        if let Request::NegotiateProtocol(ref negotiate) = request {
            let response = match self.negotiate(connection, negotiate) {
                Ok(body) => Response::success(kind, ResponseBody::Negotiated(body)),
                Err(e) => {
                    tracing::warn!(error = %e, "Protocol negotiation failed");
                    Response::failure(kind, e.to_record())
                }
            };
            self.reply(id, response).await;
            return Flow::Continue;
        }

        let version = connection.version();
        if let Err(violation) = request.check_version(version) {
            tracing::warn!(id, %kind, %violation, "Request rejected by protocol version");
            let err = HandlerError::from(violation);
            self.reply(id, Response::failure(kind, err.to_record())).await;
            return Flow::Continue;
        }

        if let Request::Shutdown(_) = request {
            tracing::info!(id, "Shutdown requested");
            self.reply(id, Response::success(kind, ResponseBody::Empty)).await;
            return Flow::Shutdown;
        }

        let Some(handler) = self.handlers.get(kind) else {
            tracing::warn!(id, %kind, "No handler registered");
            let err = HandlerError::UnknownMessageType(message_type.raw());
            self.reply(id, Response::failure(kind, err.to_record())).await;
            return Flow::Continue;
        };

        let activity_id = version.supports_tracing().then(|| {
            request
                .activity_id()
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
        });

        let span = tracing::info_span!(
            "request",
            id,
            kind = %kind,
            container_id = tracing::field::Empty,
            activity_id = tracing::field::Empty,
        );
        if let Some(container_id) = request.container_id() {
            span.record("container_id", container_id);
        }
        if let Some(ref activity_id) = activity_id {
            span.record("activity_id", activity_id.as_str());
        }

        let ctx = RequestContext {
            id,
            kind,
            version,
            activity_id: activity_id.clone(),
        };
        let task = {
            let handler = Arc::clone(handler);
            let connection = Arc::clone(connection);
            let publisher = self.publisher.clone();
            let activity_id = activity_id.clone();
            async move {
                let started = Instant::now();
                let result = match AssertUnwindSafe(handler.handle(ctx, request))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(panic = %message, "Handler panicked");
                        Err(HandlerError::Internal(format!("handler panicked: {message}")))
                    }
                };

                if connection.take_pending(id).is_none() {
                    tracing::debug!("Request already cancelled, dropping result");
                    return;
                }

                let elapsed_ms = started.elapsed().as_millis() as u64;
                let response = match result {
                    Ok(body) => {
                        tracing::debug!(elapsed_ms, "Request completed");
                        Response::success(kind, body)
                    }
                    Err(e) => {
                        tracing::warn!(elapsed_ms, error = %e, "Request failed");
                        Response::failure(kind, e.to_record())
                    }
                }
                .with_activity_id(activity_id);

                if let Err(e) = publisher.respond(id, response).await {
                    tracing::warn!(error = %e, "Failed to write response");
                }
            }
            .instrument(span)
        };

        // Spawn under the table lock so the task cannot finish before its entry exists.
        let duplicate = {
            let mut pending = connection.lock_pending();
            if pending.contains_key(&id) {
                true
            } else {
                let abort = tasks.spawn(task);
                pending.insert(
                    id,
                    PendingRequest {
                        id,
                        kind,
                        activity_id: activity_id.clone(),
                        submitted_at: Instant::now(),
                        abort,
                    },
                );
                false
            }
        };
        if duplicate {
            tracing::warn!(id, %kind, "Duplicate request id");
            let err = HandlerError::InvalidRequest(format!("request id {id} is already in flight"));
            let response = Response::failure(kind, err.to_record()).with_activity_id(activity_id);
            self.reply(id, response).await;
        }
        Flow::Continue
    }

    fn negotiate(
        &self,
        connection: &Connection,
        request: &NegotiateProtocolRequest,
    ) -> Result<NegotiateProtocolResponse, HandlerError> {
        if let Some(current) = connection.version.get() {
            return Err(HandlerError::ProtocolVersion(format!(
                "protocol version already set to {current}"
            )));
        }

        let max = self.config.max_version;
        let chosen = request.requested_version.min(max.as_u32());
        let floor = request.minimum_version.max(ProtocolVersion::LEGACY.as_u32());
        let version = ProtocolVersion::from_u32(chosen)
            .filter(|_| chosen >= floor)
            .ok_or_else(|| {
                HandlerError::ProtocolVersion(format!(
                    "no common protocol version: host wants {}..={}, agent supports {}..={}",
                    request.minimum_version,
                    request.requested_version,
                    ProtocolVersion::LEGACY.as_u32(),
                    max.as_u32()
                ))
            })?;

        if connection.version.set(version).is_err() {
            return Err(HandlerError::ProtocolVersion(
                "protocol version already set".to_string(),
            ));
        }
        tracing::info!(%version, "Negotiated protocol version");

        Ok(NegotiateProtocolResponse {
            version: version.as_u32(),
            capabilities: Capabilities {
                runtime_os_type: "linux".to_string(),
                send_lifecycle_notifications: version.supports_lifecycle_notifications(),
                supported_versions: max.up_to().map(u32::from).collect(),
                agent_version: GCS_VERSION.to_string(),
            },
        })
    }

    async fn reply(&self, id: u32, response: Response) {
        if let Err(e) = self.publisher.respond(id, response).await {
            tracing::warn!(id, error = %e, "Failed to write response");
        }
    }

    async fn write_frame(&self, frame: Frame) {
        let id = frame.id;
        if let Err(e) = self.publisher.send_frame(frame).await {
            tracing::warn!(id, error = %e, "Failed to write response");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
