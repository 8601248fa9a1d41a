//! Payload types carried by bridge frames.
//!
//! Requests are a tagged union ([`Request`]) whose tag is the frame's message
//! code rather than a JSON field. Every request except `NegotiateProtocol`
//! flattens a [`RequestBase`] carrying the optional V4 activity id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::error::{ErrorKind, ErrorRecord};
use crate::message::{RequestKind, VersionViolation};
use crate::version::ProtocolVersion;

fn is_false(value: &bool) -> bool {
    !*value
}

fn legacy_version() -> u32 {
    ProtocolVersion::LEGACY.as_u32()
}

/// Fields shared by every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
}

impl RequestBase {
    pub fn with_activity_id(activity_id: impl Into<String>) -> Self {
        Self {
            activity_id: Some(activity_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiateProtocolRequest {
    pub requested_version: u32,
    #[serde(default = "legacy_version")]
    pub minimum_version: u32,
}

/// Process description, a subset of the OCI `process` object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub terminal: bool,
}

impl ProcessSpec {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// OCI runtime bundle configuration, passed through to the runtime untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    #[serde(default)]
    pub oci: Value,
}

impl ContainerSpec {
    pub fn new(oci: Value) -> Self {
        Self { oci }
    }

    /// The container's init process (`oci.process`), if it parses.
    pub fn init_process(&self) -> Option<ProcessSpec> {
        self.oci
            .get("process")
            .and_then(|process| serde_json::from_value(process.clone()).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateContainerRequest {
    #[serde(flatten)]
    pub base: RequestBase,
    pub container_id: String,
    #[serde(default)]
    pub spec: ContainerSpec,
    /// Legal only under V4.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Request addressing a container and nothing else (start, delete).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRequest {
    #[serde(flatten)]
    pub base: RequestBase,
    pub container_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownContainerRequest {
    #[serde(flatten)]
    pub base: RequestBase,
    pub container_id: String,
    /// SIGKILL instead of SIGTERM.
    #[serde(default, skip_serializing_if = "is_false")]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecProcessRequest {
    #[serde(flatten)]
    pub base: RequestBase,
    pub container_id: String,
    pub process: ProcessSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalProcessRequest {
    #[serde(flatten)]
    pub base: RequestBase,
    pub container_id: String,
    pub pid: u32,
    pub signal: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitForProcessRequest {
    #[serde(flatten)]
    pub base: RequestBase,
    pub container_id: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyQuery {
    #[serde(default)]
    pub process_list: bool,
    #[serde(default)]
    pub runtime_state: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPropertiesRequest {
    #[serde(flatten)]
    pub base: RequestBase,
    pub container_id: String,
    #[serde(default)]
    pub query: PropertyQuery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifyRequestType {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifySettingsRequest {
    #[serde(flatten)]
    pub base: RequestBase,
    pub container_id: String,
    pub request_type: ModifyRequestType,
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    #[serde(flatten)]
    pub base: RequestBase,
}

/// Every request the host can send, one variant per [`RequestKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    CreateContainer(CreateContainerRequest),
    StartContainer(ContainerRequest),
    ShutdownContainer(ShutdownContainerRequest),
    ExecProcess(ExecProcessRequest),
    WaitForProcess(WaitForProcessRequest),
    SignalProcess(SignalProcessRequest),
    GetProperties(GetPropertiesRequest),
    ModifySettings(ModifySettingsRequest),
    NegotiateProtocol(NegotiateProtocolRequest),
    DeleteContainer(ContainerRequest),
    Shutdown(ShutdownRequest),
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::CreateContainer(_) => RequestKind::CreateContainer,
            Self::StartContainer(_) => RequestKind::StartContainer,
            Self::ShutdownContainer(_) => RequestKind::ShutdownContainer,
            Self::ExecProcess(_) => RequestKind::ExecProcess,
            Self::WaitForProcess(_) => RequestKind::WaitForProcess,
            Self::SignalProcess(_) => RequestKind::SignalProcess,
            Self::GetProperties(_) => RequestKind::GetProperties,
            Self::ModifySettings(_) => RequestKind::ModifySettings,
            Self::NegotiateProtocol(_) => RequestKind::NegotiateProtocol,
            Self::DeleteContainer(_) => RequestKind::DeleteContainer,
            Self::Shutdown(_) => RequestKind::Shutdown,
        }
    }

    pub fn base(&self) -> Option<&RequestBase> {
        match self {
            Self::CreateContainer(r) => Some(&r.base),
            Self::StartContainer(r) | Self::DeleteContainer(r) => Some(&r.base),
            Self::ShutdownContainer(r) => Some(&r.base),
            Self::ExecProcess(r) => Some(&r.base),
            Self::WaitForProcess(r) => Some(&r.base),
            Self::SignalProcess(r) => Some(&r.base),
            Self::GetProperties(r) => Some(&r.base),
            Self::ModifySettings(r) => Some(&r.base),
            Self::Shutdown(r) => Some(&r.base),
            Self::NegotiateProtocol(_) => None,
        }
    }

    pub fn activity_id(&self) -> Option<&str> {
        self.base().and_then(|base| base.activity_id.as_deref())
    }

    pub fn container_id(&self) -> Option<&str> {
        match self {
            Self::CreateContainer(r) => Some(&r.container_id),
            Self::StartContainer(r) | Self::DeleteContainer(r) => Some(&r.container_id),
            Self::ShutdownContainer(r) => Some(&r.container_id),
            Self::ExecProcess(r) => Some(&r.container_id),
            Self::WaitForProcess(r) => Some(&r.container_id),
            Self::SignalProcess(r) => Some(&r.container_id),
            Self::GetProperties(r) => Some(&r.container_id),
            Self::ModifySettings(r) => Some(&r.container_id),
            Self::NegotiateProtocol(_) | Self::Shutdown(_) => None,
        }
    }

    /// Whether this request (kind and fields) is legal under `version`.
    pub fn check_version(&self, version: ProtocolVersion) -> Result<(), VersionViolation> {
        let kind = self.kind();
        if version < kind.min_version() {
            return Err(VersionViolation {
                subject: kind.to_string(),
                required: kind.min_version(),
                negotiated: version,
            });
        }
        if self.activity_id().is_some() && !version.supports_tracing() {
            return Err(VersionViolation {
                subject: format!("{kind}.activity_id"),
                required: ProtocolVersion::V4,
                negotiated: version,
            });
        }
        if let Self::CreateContainer(create) = self
            && !create.annotations.is_empty()
            && version < ProtocolVersion::V4
        {
            return Err(VersionViolation {
                subject: format!("{kind}.annotations"),
                required: ProtocolVersion::V4,
                negotiated: version,
            });
        }
        Ok(())
    }

    pub fn decode(kind: RequestKind, payload: &[u8]) -> Result<Self, serde_json::Error> {
        fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T, serde_json::Error> {
            serde_json::from_slice(payload)
        }

        Ok(match kind {
            RequestKind::CreateContainer => Self::CreateContainer(parse(payload)?),
            RequestKind::StartContainer => Self::StartContainer(parse(payload)?),
            RequestKind::ShutdownContainer => Self::ShutdownContainer(parse(payload)?),
            RequestKind::ExecProcess => Self::ExecProcess(parse(payload)?),
            RequestKind::WaitForProcess => Self::WaitForProcess(parse(payload)?),
            RequestKind::SignalProcess => Self::SignalProcess(parse(payload)?),
            RequestKind::GetProperties => Self::GetProperties(parse(payload)?),
            RequestKind::ModifySettings => Self::ModifySettings(parse(payload)?),
            RequestKind::NegotiateProtocol => Self::NegotiateProtocol(parse(payload)?),
            RequestKind::DeleteContainer => Self::DeleteContainer(parse(payload)?),
            RequestKind::Shutdown => Self::Shutdown(parse(payload)?),
        })
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::CreateContainer(r) => serde_json::to_vec(r),
            Self::StartContainer(r) | Self::DeleteContainer(r) => serde_json::to_vec(r),
            Self::ShutdownContainer(r) => serde_json::to_vec(r),
            Self::ExecProcess(r) => serde_json::to_vec(r),
            Self::WaitForProcess(r) => serde_json::to_vec(r),
            Self::SignalProcess(r) => serde_json::to_vec(r),
            Self::GetProperties(r) => serde_json::to_vec(r),
            Self::ModifySettings(r) => serde_json::to_vec(r),
            Self::NegotiateProtocol(r) => serde_json::to_vec(r),
            Self::Shutdown(r) => serde_json::to_vec(r),
        }
    }
}

/// What the agent can do, reported by a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub runtime_os_type: String,
    /// Container lifecycle notifications (V4 and later). Process exit
    /// notifications do not depend on it and are sent at every version.
    pub send_lifecycle_notifications: bool,
    pub supported_versions: Vec<u32>,
    pub agent_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiateProtocolResponse {
    pub version: u32,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecProcessResponse {
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitForProcessResponse {
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Exited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDetails {
    pub pid: u32,
    pub state: ProcessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerProperties {
    pub container_id: String,
    pub state: ContainerStatus,
    #[serde(default)]
    pub processes: Vec<ProcessDetails>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// OS pids reported by the runtime, when the query asked for them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_pids: Option<Vec<u32>>,
    /// Runtime state document, when the query asked for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_state: Option<Value>,
}

/// Successful response bodies. Kinds with nothing to report use `Empty`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Negotiated(NegotiateProtocolResponse),
    Exec(ExecProcessResponse),
    Wait(WaitForProcessResponse),
    Properties(ContainerProperties),
}

impl ResponseBody {
    fn to_object(&self) -> Result<Map<String, Value>, serde_json::Error> {
        let value = match self {
            Self::Empty => return Ok(Map::new()),
            Self::Negotiated(body) => serde_json::to_value(body)?,
            Self::Exec(body) => serde_json::to_value(body)?,
            Self::Wait(body) => serde_json::to_value(body)?,
            Self::Properties(body) => serde_json::to_value(body)?,
        };
        match value {
            Value::Object(object) => Ok(object),
            other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
                "response body must be an object, got {other}"
            ))),
        }
    }

    fn from_object(kind: RequestKind, object: Map<String, Value>) -> Result<Self, serde_json::Error> {
        let value = Value::Object(object);
        Ok(match kind {
            RequestKind::NegotiateProtocol => Self::Negotiated(serde_json::from_value(value)?),
            RequestKind::ExecProcess => Self::Exec(serde_json::from_value(value)?),
            RequestKind::WaitForProcess => Self::Wait(serde_json::from_value(value)?),
            RequestKind::GetProperties => Self::Properties(serde_json::from_value(value)?),
            _ => Self::Empty,
        })
    }
}

/// Response to one request. The wire form is a flat object:
/// `{"result": i32, "activity_id"?, "error"?, ...body}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub kind: RequestKind,
    pub activity_id: Option<String>,
    pub outcome: Result<ResponseBody, ErrorRecord>,
}

impl Response {
    pub fn success(kind: RequestKind, body: ResponseBody) -> Self {
        Self {
            kind,
            activity_id: None,
            outcome: Ok(body),
        }
    }

    pub fn failure(kind: RequestKind, error: ErrorRecord) -> Self {
        Self {
            kind,
            activity_id: None,
            outcome: Err(error),
        }
    }

    pub fn with_activity_id(mut self, activity_id: Option<String>) -> Self {
        self.activity_id = activity_id;
        self
    }

    pub fn result(&self) -> i32 {
        match &self.outcome {
            Ok(_) => 0,
            Err(record) => record.result_code(),
        }
    }

    pub fn error(&self) -> Option<&ErrorRecord> {
        self.outcome.as_ref().err()
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut object = match &self.outcome {
            Ok(body) => body.to_object()?,
            Err(_) => Map::new(),
        };
        object.insert("result".to_string(), Value::from(self.result()));
        if let Some(ref activity_id) = self.activity_id {
            object.insert("activity_id".to_string(), Value::from(activity_id.as_str()));
        }
        if let Err(ref record) = self.outcome {
            object.insert("error".to_string(), serde_json::to_value(record)?);
        }
        serde_json::to_vec(&Value::Object(object))
    }

    pub fn decode(kind: RequestKind, payload: &[u8]) -> Result<Self, serde_json::Error> {
        let mut object: Map<String, Value> = serde_json::from_slice(payload)?;
        let result: i32 = match object.remove("result") {
            Some(value) => serde_json::from_value(value)?,
            None => 0,
        };
        let activity_id: Option<String> = object
            .remove("activity_id")
            .map(serde_json::from_value)
            .transpose()?;
        let error: Option<ErrorRecord> = object
            .remove("error")
            .map(serde_json::from_value)
            .transpose()?;

        let outcome = match error {
            Some(record) => Err(record),
            None if result != 0 => Err(ErrorRecord::new(
                ErrorKind::Internal,
                format!("request failed with result {result:#010x}"),
            )),
            None => Ok(ResponseBody::from_object(kind, object)?),
        };
        Ok(Self {
            kind,
            activity_id,
            outcome,
        })
    }
}

/// Sent when a watched process exits. Carries the container-scoped pid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExitNotification {
    pub container_id: String,
    pub pid: u32,
    pub exit_code: i32,
}
