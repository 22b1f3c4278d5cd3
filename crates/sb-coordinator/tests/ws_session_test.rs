//! End-to-end control-plane tests: a real server on an ephemeral port
//! driven by a fake worker over tokio-tungstenite.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use sb_coordinator::Coordinator;
use sb_core::types::{TaskSpec, TaskStatus, TokenUsage, WorkerStatus};
use sb_protocol::payload::{CompletePayload, RegisterAckPayload, RegisterPayload};
use sb_protocol::{Envelope, MessageKind, StreamEvent, PROTOCOL_VERSION};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_coordinator() -> (Coordinator, String) {
    let coordinator = Coordinator::new("s3cret");
    let app = coordinator.router();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (coordinator, format!("ws://{addr}/ws"))
}

fn register_payload(name: &str, secret: &str) -> RegisterPayload {
    RegisterPayload {
        secret: secret.into(),
        name: name.into(),
        os: "linux".into(),
        runtime_version: "0.4.2".into(),
        cli_version: String::new(),
        default_cwd: "/home/dev".into(),
        allowed_dirs: vec!["/home/dev".into()],
        protocol_version: PROTOCOL_VERSION.into(),
    }
}

async fn send(ws: &mut Socket, envelope: Envelope) {
    ws.send(Message::Text(envelope.encode().unwrap()))
        .await
        .unwrap();
}

async fn recv_envelope(ws: &mut Socket) -> Envelope {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("transport error");
        if let Message::Text(text) = frame {
            return Envelope::decode(&text).unwrap();
        }
    }
}

async fn register(url: &str, name: &str, secret: &str) -> (Socket, RegisterAckPayload) {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    send(
        &mut ws,
        Envelope::from_payload(MessageKind::WorkerRegister, &register_payload(name, secret))
            .unwrap()
            .with_worker(name),
    )
    .await;
    let ack = recv_envelope(&mut ws).await;
    assert_eq!(ack.kind, MessageKind::WorkerRegisterAck);
    let payload = ack.payload_as().unwrap();
    (ws, payload)
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn happy_path_from_register_to_completion() {
    let (coordinator, url) = start_coordinator().await;
    let (mut ws, ack) = register(&url, "w1", "s3cret").await;
    assert!(ack.success);

    let task = coordinator
        .manager
        .create_task(TaskSpec {
            prompt: "hello".into(),
            ..TaskSpec::default()
        })
        .await
        .unwrap();
    coordinator.manager.dispatch_next().await;

    let assign = recv_envelope(&mut ws).await;
    assert_eq!(assign.kind, MessageKind::TaskAssign);
    assert_eq!(assign.task_id.as_deref(), Some(task.id.as_str()));
    assert_eq!(assign.payload["prompt"], "hello");

    let usage = TokenUsage {
        input: 10,
        output: 2,
        cache_read: 0,
        cache_write: 0,
    };
    for event in [
        StreamEvent::AssistantMessage { text: "Hi".into() },
        StreamEvent::Result {
            text: "Hi".into(),
            session_id: Some("s1".into()),
        },
        StreamEvent::TokenUsage { usage },
    ] {
        send(
            &mut ws,
            Envelope::from_payload(MessageKind::TaskStream, &event)
                .unwrap()
                .with_task(&task.id)
                .with_worker("w1"),
        )
        .await;
    }
    send(
        &mut ws,
        Envelope::from_payload(
            MessageKind::TaskComplete,
            &CompletePayload {
                result_text: "Hi".into(),
                session_id: Some("s1".into()),
                usage,
            },
        )
        .unwrap()
        .with_task(&task.id)
        .with_worker("w1"),
    )
    .await;

    let manager = Arc::clone(&coordinator.manager);
    let task_id = task.id.clone();
    wait_until(move || {
        let manager = Arc::clone(&manager);
        let task_id = task_id.clone();
        async move { manager.task(&task_id).await.unwrap().status == TaskStatus::Completed }
    })
    .await;

    let final_task = coordinator.manager.task(&task.id).await.unwrap();
    assert_eq!(final_task.result_text, "Hi");
    assert_eq!(final_task.session_id.as_deref(), Some("s1"));
    assert_eq!(final_task.usage, usage);

    let worker = coordinator.registry.worker("w1").await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Online);
    assert!(worker.current_task_id.is_none());
}

#[tokio::test]
async fn disconnect_fails_running_task_and_later_worker_unblocks_queue() {
    let (coordinator, url) = start_coordinator().await;
    let (mut ws, _) = register(&url, "w1", "s3cret").await;

    let task_a = coordinator
        .manager
        .create_task(TaskSpec {
            prompt: "first".into(),
            ..TaskSpec::default()
        })
        .await
        .unwrap();
    coordinator.manager.dispatch_next().await;
    let assign = recv_envelope(&mut ws).await;
    assert_eq!(assign.task_id.as_deref(), Some(task_a.id.as_str()));

    let task_c = coordinator
        .manager
        .create_task(TaskSpec {
            prompt: "queued".into(),
            ..TaskSpec::default()
        })
        .await
        .unwrap();

    // Socket drops mid-task.
    drop(ws);

    let manager = Arc::clone(&coordinator.manager);
    let id_a = task_a.id.clone();
    wait_until(move || {
        let manager = Arc::clone(&manager);
        let id = id_a.clone();
        async move { manager.task(&id).await.unwrap().status == TaskStatus::Failed }
    })
    .await;

    let failed = coordinator.manager.task(&task_a.id).await.unwrap();
    let message = failed.error_message.unwrap().to_lowercase();
    assert!(message.contains("worker"));
    assert!(message.contains("disconnect"));

    assert_eq!(
        coordinator.manager.task(&task_c.id).await.unwrap().status,
        TaskStatus::Queued
    );

    // A fresh worker unblocks dispatch via the connect glue.
    let (mut ws2, _) = register(&url, "w2", "s3cret").await;
    let assign_c = recv_envelope(&mut ws2).await;
    assert_eq!(assign_c.kind, MessageKind::TaskAssign);
    assert_eq!(assign_c.task_id.as_deref(), Some(task_c.id.as_str()));
    assert_eq!(
        coordinator.manager.task(&task_c.id).await.unwrap().worker_id.as_deref(),
        Some("w2")
    );
}

#[tokio::test]
async fn wrong_secret_is_rejected_and_socket_closed() {
    let (coordinator, url) = start_coordinator().await;
    let (mut ws, ack) = register(&url, "intruder", "wrong").await;
    assert!(!ack.success);

    // The server closes after the rejection ack.
    let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for close");
    match next {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("expected close, got {other:?}"),
    }

    assert!(coordinator.registry.worker("intruder").await.is_none());
}

#[tokio::test]
async fn heartbeat_is_acknowledged() {
    let (_coordinator, url) = start_coordinator().await;
    let (mut ws, _) = register(&url, "w1", "s3cret").await;

    send(
        &mut ws,
        Envelope::from_payload(
            MessageKind::WorkerHeartbeat,
            &sb_protocol::payload::HeartbeatPayload {
                status: WorkerStatus::Online,
                current_task_id: None,
            },
        )
        .unwrap()
        .with_worker("w1"),
    )
    .await;

    let ack = recv_envelope(&mut ws).await;
    assert_eq!(ack.kind, MessageKind::WorkerHeartbeatAck);
}
