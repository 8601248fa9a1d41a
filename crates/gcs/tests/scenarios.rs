//! End-to-end behaviour of the bridge and host over an in-memory connection.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use common::{FIRST_OS_PID, Harness, create, delete, exec, properties, shutdown_container, start, wait};
use gcs::BridgeError;
use gcs::host::ContainerState;
use gcs_bridge::protocol::{
    ContainerRequest, ContainerStatus, CreateContainerRequest, ModifyRequestType,
    ModifySettingsRequest, ProcessDetails, ProcessExitNotification, ProcessStatus, PropertyQuery,
    RequestBase, ShutdownRequest, SignalProcessRequest,
};
use gcs_bridge::{
    Category, ErrorKind, Frame, MessageType, ProtocolVersion, Request, Response, ResponseBody,
};
use serde_json::{Value, json};

fn assert_ok(response: &Response) {
    assert!(response.outcome.is_ok(), "expected success, got {response:?}");
}

fn error_kind(response: &Response) -> ErrorKind {
    response
        .error()
        .unwrap_or_else(|| panic!("expected failure, got {response:?}"))
        .kind
}

fn exec_pid(response: &Response) -> u32 {
    match response.outcome {
        Ok(ResponseBody::Exec(ref exec)) => exec.pid,
        ref other => panic!("expected exec response, got {other:?}"),
    }
}

async fn running(harness: &mut Harness, id: &str) {
    assert_ok(&harness.call(create(id)).await);
    assert_ok(&harness.call(start(id)).await);
}

#[tokio::test]
async fn exec_exit_is_notified_once_and_wait_returns_code() {
    let mut harness = Harness::new(ProtocolVersion::V4);
    assert_ok(&harness.negotiate(ProtocolVersion::V4).await);
    running(&mut harness, "c1").await;

    let response = harness.call(exec("c1", "true")).await;
    assert_eq!(exec_pid(&response), 1);

    // Init took the first OS pid, the exec'd process the second.
    harness.runtime.exit(FIRST_OS_PID + 1, 0);
    let exit = harness.next_notification().await;
    assert_eq!(
        exit,
        ProcessExitNotification {
            container_id: "c1".into(),
            pid: 1,
            exit_code: 0,
        }
    );

    // The recorded exit answers the wait without asking the runtime again.
    let waits_before = harness.runtime.count("wait");
    let response = harness.call(wait("c1", 1)).await;
    assert_eq!(response.outcome, Ok(ResponseBody::Wait(gcs_bridge::protocol::WaitForProcessResponse { exit_code: 0 })));
    assert_eq!(harness.runtime.count("wait"), waits_before);
    harness.assert_no_notification(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn exec_on_created_container_allocates_no_pid() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    assert_ok(&harness.call(create("c1")).await);

    let response = harness.call(exec("c1", "true")).await;
    assert_eq!(error_kind(&response), ErrorKind::InvalidContainerState);
    assert!(!harness.runtime.calls().iter().any(|call| call.starts_with("exec")));

    assert_ok(&harness.call(start("c1")).await);
    let response = harness.call(exec("c1", "true")).await;
    assert_eq!(exec_pid(&response), 1);
}

#[tokio::test]
async fn start_failure_keeps_container_created() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    assert_ok(&harness.call(create("c1")).await);

    harness
        .runtime
        .fail_next("start", "container_linux.go:380: starting container process caused: exec format error");
    let response = harness.call(start("c1")).await;
    let error = response.error().unwrap();
    assert_eq!(error.kind, ErrorKind::RuntimeInvocation);
    assert_eq!(
        error.cause.as_deref(),
        Some("container_linux.go:380: starting container process caused: exec format error")
    );
    assert_eq!(response.result(), ErrorKind::RuntimeInvocation.result_code());
    assert_eq!(harness.host.container_state("c1").await, Some(ContainerState::Created));

    assert_ok(&harness.call(start("c1")).await);
    assert_eq!(harness.host.container_state("c1").await, Some(ContainerState::Running));
}

#[tokio::test]
async fn create_failure_leaves_no_container() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    harness.runtime.fail_next("create", "bundle rootfs missing");

    let response = harness.call(create("c1")).await;
    assert_eq!(error_kind(&response), ErrorKind::RuntimeInvocation);
    assert!(harness.host.registry().is_empty());

    // The id is free again.
    assert_ok(&harness.call(create("c1")).await);
}

#[tokio::test]
async fn create_rejects_ids_that_are_not_a_single_path_component() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    for id in ["", ".", "..", "../escaped", "/abs", "a/b", "-rf"] {
        let response = harness.call(create(id)).await;
        assert_eq!(error_kind(&response), ErrorKind::InvalidRequest, "{id:?}");
    }
    assert!(harness.runtime.calls().is_empty());
    assert!(harness.host.registry().is_empty());

    assert_ok(&harness.call(create("pod_1.sandbox")).await);
}

#[tokio::test]
async fn duplicate_create_is_rejected() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    assert_ok(&harness.call(create("c1")).await);
    let response = harness.call(create("c1")).await;
    assert_eq!(error_kind(&response), ErrorKind::InvalidContainerState);
}

#[tokio::test]
async fn delete_is_idempotent_and_final() {
    let mut harness = Harness::new(ProtocolVersion::V4);
    assert_ok(&harness.negotiate(ProtocolVersion::V4).await);
    assert_ok(&harness.call(create("c1")).await);

    assert_ok(&harness.call(delete("c1")).await);
    assert_ok(&harness.call(delete("c1")).await);
    let deletes = harness
        .runtime
        .calls()
        .iter()
        .filter(|call| call.starts_with("delete"))
        .count();
    assert_eq!(deletes, 1);

    let response = harness.call(start("c1")).await;
    assert_eq!(error_kind(&response), ErrorKind::InvalidContainerState);
    assert_eq!(harness.host.container_state("c1").await, Some(ContainerState::Deleted));

    // A tombstoned id can be created again.
    assert_ok(&harness.call(create("c1")).await);
    assert_eq!(harness.host.container_state("c1").await, Some(ContainerState::Created));
}

#[tokio::test]
async fn delete_refused_while_processes_run() {
    let mut harness = Harness::new(ProtocolVersion::V4);
    assert_ok(&harness.negotiate(ProtocolVersion::V4).await);
    running(&mut harness, "c1").await;

    let response = harness.call(delete("c1")).await;
    assert_eq!(error_kind(&response), ErrorKind::InvalidContainerState);
    assert_eq!(harness.host.container_state("c1").await, Some(ContainerState::Running));

    assert_ok(&harness.call(shutdown_container("c1", false)).await);
    let exit = harness.next_notification().await;
    assert_eq!((exit.pid, exit.exit_code), (0, 128 + 15));
    assert_eq!(harness.host.container_state("c1").await, Some(ContainerState::Stopped));

    assert_ok(&harness.call(delete("c1")).await);
}

#[tokio::test]
async fn shutdown_container_is_noop_when_stopped() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    running(&mut harness, "c1").await;

    assert_ok(&harness.call(shutdown_container("c1", true)).await);
    let exit = harness.next_notification().await;
    assert_eq!(exit.exit_code, 128 + 9);

    let signals_before = harness.runtime.count("signal");
    assert_ok(&harness.call(shutdown_container("c1", true)).await);
    assert_eq!(harness.runtime.count("signal"), signals_before);

    let response = harness.call(start("c1")).await;
    assert_eq!(error_kind(&response), ErrorKind::InvalidContainerState);
}

#[tokio::test]
async fn shutdown_container_rejects_created() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    assert_ok(&harness.call(create("c1")).await);
    let response = harness.call(shutdown_container("c1", false)).await;
    assert_eq!(error_kind(&response), ErrorKind::InvalidContainerState);
}

#[tokio::test]
async fn init_exit_stops_container() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    running(&mut harness, "c1").await;

    harness.runtime.exit(FIRST_OS_PID, 2);
    let exit = harness.next_notification().await;
    assert_eq!((exit.pid, exit.exit_code), (0, 2));
    assert_eq!(harness.host.container_state("c1").await, Some(ContainerState::Stopped));

    let response = harness.call(exec("c1", "true")).await;
    assert_eq!(error_kind(&response), ErrorKind::InvalidContainerState);
}

#[tokio::test]
async fn container_runs_until_its_last_process_exits() {
    let mut harness = Harness::new(ProtocolVersion::V4);
    assert_ok(&harness.negotiate(ProtocolVersion::V4).await);
    running(&mut harness, "c1").await;
    let pid = exec_pid(&harness.call(exec("c1", "sleep")).await);

    harness.runtime.exit(FIRST_OS_PID, 0);
    let exit = harness.next_notification().await;
    assert_eq!((exit.pid, exit.exit_code), (0, 0));
    assert_eq!(harness.host.container_state("c1").await, Some(ContainerState::Running));
    let response = harness.call(delete("c1")).await;
    assert_eq!(error_kind(&response), ErrorKind::InvalidContainerState);

    harness.runtime.exit(FIRST_OS_PID + 1, 5);
    let exit = harness.next_notification().await;
    assert_eq!((exit.pid, exit.exit_code), (pid, 5));
    assert_eq!(harness.host.container_state("c1").await, Some(ContainerState::Stopped));
    assert_ok(&harness.call(delete("c1")).await);
}

#[tokio::test]
async fn shutdown_signals_every_running_process() {
    let mut harness = Harness::new(ProtocolVersion::V4);
    assert_ok(&harness.negotiate(ProtocolVersion::V4).await);
    running(&mut harness, "c1").await;
    let pid = exec_pid(&harness.call(exec("c1", "sleep")).await);

    assert_ok(&harness.call(shutdown_container("c1", false)).await);
    assert_eq!(harness.host.container_state("c1").await, Some(ContainerState::Stopped));
    assert_eq!(harness.runtime.count("signal"), 2);

    let exits: BTreeSet<_> = [
        harness.next_notification().await,
        harness.next_notification().await,
    ]
    .into_iter()
    .map(|exit| (exit.pid, exit.exit_code))
    .collect();
    assert_eq!(exits, BTreeSet::from([(0, 143), (pid, 143)]));
    assert_ok(&harness.call(delete("c1")).await);
}

#[tokio::test]
async fn v3_reports_exits_without_lifecycle_notifications() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    let response = harness.negotiate(ProtocolVersion::V3).await;
    let Ok(ResponseBody::Negotiated(negotiated)) = response.outcome else {
        panic!("negotiation failed: {response:?}");
    };
    assert!(!negotiated.capabilities.send_lifecycle_notifications);

    running(&mut harness, "c1").await;
    let pid = exec_pid(&harness.call(exec("c1", "true")).await);
    harness.runtime.exit(FIRST_OS_PID + 1, 0);
    let exit = harness.next_notification().await;
    assert_eq!((exit.pid, exit.exit_code), (pid, 0));
}

#[tokio::test]
async fn signal_reaches_the_process() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    running(&mut harness, "c1").await;
    let pid = exec_pid(&harness.call(exec("c1", "sleep")).await);

    let signal = |signal| {
        Request::SignalProcess(SignalProcessRequest {
            base: RequestBase::default(),
            container_id: "c1".into(),
            pid,
            signal,
        })
    };
    assert_ok(&harness.call(signal(9)).await);
    let exit = harness.next_notification().await;
    assert_eq!((exit.pid, exit.exit_code), (pid, 137));

    // Exited processes cannot be signalled.
    let response = harness.call(signal(9)).await;
    assert_eq!(error_kind(&response), ErrorKind::InvalidContainerState);

    let response = harness.call(signal(-1)).await;
    assert_eq!(error_kind(&response), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn later_version_message_rejected_before_negotiation() {
    let mut harness = Harness::new(ProtocolVersion::V4);
    assert_ok(&harness.call(create("c1")).await);

    // The first request pinned V2; DeleteContainer needs V4.
    let response = harness.call(delete("c1")).await;
    assert_eq!(error_kind(&response), ErrorKind::ProtocolVersion);
    assert!(!harness.runtime.calls().iter().any(|call| call.starts_with("delete")));

    // Negotiating after the pin is refused as well.
    let response = harness.negotiate(ProtocolVersion::V4).await;
    assert_eq!(error_kind(&response), ErrorKind::ProtocolVersion);
}

#[tokio::test]
async fn v3_rejects_v4_only_messages_and_fields() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    let response = harness
        .call(Request::NegotiateProtocol(
            gcs_bridge::protocol::NegotiateProtocolRequest {
                requested_version: 4,
                minimum_version: 2,
            },
        ))
        .await;
    let Ok(ResponseBody::Negotiated(ref negotiated)) = response.outcome else {
        panic!("negotiation failed: {response:?}");
    };
    assert_eq!(negotiated.version, 3);

    let response = harness.call(delete("c1")).await;
    assert_eq!(error_kind(&response), ErrorKind::ProtocolVersion);

    let annotated = Request::CreateContainer(CreateContainerRequest {
        annotations: [("io.kubernetes.pod".to_string(), "p1".to_string())].into(),
        ..match create("c1") {
            Request::CreateContainer(create) => create,
            _ => unreachable!(),
        }
    });
    let response = harness.call(annotated).await;
    assert_eq!(error_kind(&response), ErrorKind::ProtocolVersion);

    let traced = Request::StartContainer(ContainerRequest {
        base: RequestBase::with_activity_id("a1"),
        container_id: "c1".into(),
    });
    let response = harness.call(traced).await;
    assert_eq!(error_kind(&response), ErrorKind::ProtocolVersion);

    assert!(harness.runtime.calls().is_empty());
    assert!(harness.host.registry().is_empty());
}

#[tokio::test]
async fn v4_echoes_activity_id() {
    let mut harness = Harness::new(ProtocolVersion::V4);
    assert_ok(&harness.negotiate(ProtocolVersion::V4).await);

    let request = Request::CreateContainer(CreateContainerRequest {
        base: RequestBase::with_activity_id("11111111-2222-3333-4444-555555555555"),
        annotations: [("owner".to_string(), "test".to_string())].into(),
        ..match create("c1") {
            Request::CreateContainer(create) => create,
            _ => unreachable!(),
        }
    });
    let response = harness.call(request).await;
    assert_ok(&response);
    assert_eq!(
        response.activity_id.as_deref(),
        Some("11111111-2222-3333-4444-555555555555")
    );

    let response = harness.call(properties("c1", PropertyQuery::default())).await;
    assert!(response.activity_id.is_some());
    let Ok(ResponseBody::Properties(props)) = response.outcome else {
        panic!("expected properties");
    };
    assert_eq!(props.annotations.get("owner").map(String::as_str), Some("test"));
}

#[tokio::test]
async fn unknown_message_type_is_answered_and_connection_survives() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    let unknown = MessageType::new(Category::Request, 0x109901);
    harness.send_raw(Frame::new(unknown, 42, b"{}".to_vec())).await;

    let frame = harness.recv_frame().await;
    assert_eq!(frame.id, 42);
    assert_eq!(frame.message_type, MessageType::new(Category::Response, 0x109901));
    let payload: Value = serde_json::from_slice(&frame.payload).unwrap();
    assert_eq!(
        payload,
        json!({
            "result": ErrorKind::UnknownMessageType.result_code(),
            "error": {
                "kind": "UnknownMessageType",
                "message": "unknown message type 0x10109901",
            },
        })
    );

    assert_ok(&harness.call(create("c1")).await);
}

#[tokio::test]
async fn undecodable_payload_is_invalid_request() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    let frame = Frame::new(
        gcs_bridge::RequestKind::StartContainer.request_type(),
        5,
        b"{\"container_id\": 17}".to_vec(),
    );
    harness.send_raw(frame).await;
    let response = harness.response(5).await;
    assert_eq!(error_kind(&response), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn frame_error_ends_the_connection() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    // Category nibble 7 does not exist.
    let mut header = Vec::new();
    header.extend_from_slice(&0x7010_0101u32.to_le_bytes());
    header.extend_from_slice(&1u32.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes());
    harness.send_bytes(&header).await;

    assert!(matches!(harness.join().await, Err(BridgeError::Frame(_))));
}

#[tokio::test]
async fn host_hang_up_ends_the_connection() {
    let harness = Harness::new(ProtocolVersion::V3);
    assert!(matches!(harness.hang_up().await, Err(BridgeError::TransportClosed)));
}

#[tokio::test]
async fn concurrent_requests_each_get_one_response() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    let mut ids = BTreeSet::new();
    for n in 0..16 {
        ids.insert(harness.send(create(&format!("c{n}"))).await);
    }

    let mut answered = BTreeSet::new();
    for _ in 0..16 {
        let frame = harness.recv_frame().await;
        assert_eq!(frame.message_type.category(), Category::Response);
        assert!(answered.insert(frame.id), "second response for {}", frame.id);
    }
    assert_eq!(answered, ids);
    assert_eq!(harness.host.registry().len(), 16);
}

#[tokio::test]
async fn pending_wait_does_not_block_other_requests() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    running(&mut harness, "c1").await;
    let pid = exec_pid(&harness.call(exec("c1", "sleep")).await);

    let waiting = harness.send(wait("c1", pid)).await;
    let response = harness.call(properties("c1", PropertyQuery::default())).await;
    assert_ok(&response);

    harness.runtime.exit(FIRST_OS_PID + 1, 5);
    let response = harness.response(waiting).await;
    assert_eq!(
        response.outcome,
        Ok(ResponseBody::Wait(gcs_bridge::protocol::WaitForProcessResponse { exit_code: 5 }))
    );
    assert_eq!(harness.next_notification().await.exit_code, 5);
}

#[tokio::test]
async fn duplicate_request_id_is_rejected() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    running(&mut harness, "c1").await;

    harness.send_with_id(50, wait("c1", 0)).await;
    harness.send_with_id(50, properties("c1", PropertyQuery::default())).await;
    let response = harness.response(50).await;
    assert_eq!(error_kind(&response), ErrorKind::InvalidRequest);

    harness.runtime.exit(FIRST_OS_PID, 0);
    let response = harness.response(50).await;
    assert!(matches!(response.outcome, Ok(ResponseBody::Wait(_))));
}

#[tokio::test]
async fn shutdown_cancels_pending_requests() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    running(&mut harness, "c1").await;

    let waiting = harness.send(wait("c1", 0)).await;
    let shutdown = harness.send(Request::Shutdown(ShutdownRequest::default())).await;

    assert_ok(&harness.response(shutdown).await);
    let response = harness.response(waiting).await;
    assert_eq!(error_kind(&response), ErrorKind::Cancelled);

    assert!(harness.join().await.is_ok());
}

#[tokio::test]
async fn modify_settings_and_properties() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    assert_ok(&harness.negotiate(ProtocolVersion::V3).await);
    running(&mut harness, "c1").await;
    let pid = exec_pid(&harness.call(exec("c1", "sleep")).await);

    let modify = |request_type, value| {
        Request::ModifySettings(ModifySettingsRequest {
            base: RequestBase::default(),
            container_id: "c1".into(),
            request_type,
            key: "cpu_shares".into(),
            value,
        })
    };
    assert_ok(&harness.call(modify(ModifyRequestType::Add, json!(512))).await);
    let response = harness.call(modify(ModifyRequestType::Add, json!(256))).await;
    assert_eq!(error_kind(&response), ErrorKind::InvalidRequest);
    assert_ok(&harness.call(modify(ModifyRequestType::Update, json!(1024))).await);

    let query = PropertyQuery {
        process_list: true,
        runtime_state: true,
    };
    let response = harness.call(properties("c1", query)).await;
    let Ok(ResponseBody::Properties(props)) = response.outcome else {
        panic!("expected properties, got {response:?}");
    };
    assert_eq!(props.state, ContainerStatus::Running);
    assert_eq!(props.settings.get("cpu_shares"), Some(&json!(1024)));
    assert_eq!(props.runtime_pids, Some(vec![FIRST_OS_PID, FIRST_OS_PID + 1]));
    assert_eq!(props.runtime_state, Some(json!({ "status": "running" })));
    assert_eq!(
        props.processes,
        vec![
            ProcessDetails {
                pid: 0,
                state: ProcessStatus::Running,
                exit_code: None,
            },
            ProcessDetails {
                pid,
                state: ProcessStatus::Running,
                exit_code: None,
            },
        ]
    );

    assert_ok(&harness.call(modify(ModifyRequestType::Remove, Value::Null)).await);
    let response = harness.call(modify(ModifyRequestType::Update, json!(1))).await;
    assert_eq!(error_kind(&response), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn null_runtime_state_is_absent() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    running(&mut harness, "c1").await;
    harness.runtime.set_state(Value::Null);

    let query = PropertyQuery {
        process_list: false,
        runtime_state: true,
    };
    let response = harness.call(properties("c1", query)).await;
    let Ok(ResponseBody::Properties(props)) = response.outcome else {
        panic!("expected properties, got {response:?}");
    };
    assert_eq!(props.runtime_state, None);
    assert_eq!(props.runtime_pids, None);
}

#[tokio::test]
async fn unknown_container_is_invalid_state() {
    let mut harness = Harness::new(ProtocolVersion::V3);
    let response = harness.call(start("missing")).await;
    assert_eq!(error_kind(&response), ErrorKind::InvalidContainerState);
    let response = harness.call(wait("missing", 0)).await;
    assert_eq!(error_kind(&response), ErrorKind::InvalidContainerState);
}
