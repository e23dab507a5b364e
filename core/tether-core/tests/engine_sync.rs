use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use tempfile::TempDir;
use tether_core::{
    AppTransition, BackoffPolicy, ConnectTarget, ConnectionState, Engine, EngineConfig,
    EngineEvent, HeartbeatConfig, LifecycleConfig, Message, PersistenceStore, ProjectDescriptor,
    PushOutcome, Sender, StorageConfig, StreamingState, UserNotice,
};
use tether_protocol::{
    AnyValue, Envelope, ErrorInfo, HistoryMessage, Payload, SessionHistory, SessionStarted,
    StreamData, StreamFragment, Subscribed, Welcome,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

// ─────────────────────────────────────────────────────────────────────────────
// In-process server
// ─────────────────────────────────────────────────────────────────────────────

enum ServerOut {
    Frame(Envelope),
    Close(u16),
    Drop,
}

struct ServerConn {
    incoming: mpsc::UnboundedReceiver<Envelope>,
    outgoing: mpsc::UnboundedSender<ServerOut>,
}

impl ServerConn {
    fn send(&self, payload: Payload) {
        self.outgoing
            .send(ServerOut::Frame(Envelope::new(payload)))
            .expect("server connection gone");
    }

    fn reply(&self, request: &Envelope, payload: Payload) {
        let id = request.correlation_id.clone().expect("request has id");
        self.outgoing
            .send(ServerOut::Frame(Envelope::new(payload).with_correlation_id(id)))
            .expect("server connection gone");
    }

    fn welcome(&self) {
        self.send(Payload::Welcome(Welcome {
            server_version: Some("test".into()),
            client_id: None,
        }));
    }

    /// Next client frame with `type_tag`, skipping heartbeat pings.
    async fn expect(&mut self, type_tag: &str) -> Envelope {
        timeout(WAIT, async {
            loop {
                let envelope = self.incoming.recv().await.expect("client hung up");
                if envelope.type_tag() == type_tag {
                    return envelope;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {type_tag}"))
    }

    async fn assert_silent(&mut self, type_tag: &str) {
        let seen = timeout(QUIET, async {
            loop {
                match self.incoming.recv().await {
                    Some(envelope) if envelope.type_tag() == type_tag => return true,
                    Some(_) => continue,
                    None => return false,
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(!seen, "unexpected {type_tag} frame");
    }
}

struct FakeServer {
    endpoint: String,
    accepted: mpsc::UnboundedReceiver<ServerConn>,
}

impl FakeServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = format!("ws://{}/ws", listener.local_addr().expect("addr"));
        let (accepted_tx, accepted) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
                    continue;
                };
                let (in_tx, incoming) = mpsc::unbounded_channel();
                let (outgoing, mut out_rx) = mpsc::unbounded_channel();
                if accepted_tx.send(ServerConn { incoming, outgoing }).is_err() {
                    return;
                }
                tokio::spawn(async move {
                    let (mut sink, mut stream) = ws.split();
                    loop {
                        tokio::select! {
                            frame = stream.next() => match frame {
                                Some(Ok(WsMessage::Text(text))) => {
                                    if let Ok(envelope) = Envelope::decode(text.as_str()) {
                                        let _ = in_tx.send(envelope);
                                    }
                                }
                                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                            out = out_rx.recv() => match out {
                                Some(ServerOut::Frame(envelope)) => {
                                    let text = envelope.encode().expect("encode");
                                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Some(ServerOut::Close(code)) => {
                                    let _ = sink
                                        .send(WsMessage::Close(Some(CloseFrame {
                                            code: CloseCode::from(code),
                                            reason: "bye".into(),
                                        })))
                                        .await;
                                    break;
                                }
                                Some(ServerOut::Drop) | None => break,
                            },
                        }
                    }
                });
            }
        });
        Self { endpoint, accepted }
    }

    fn target(&self) -> ConnectTarget {
        ConnectTarget {
            endpoint: self.endpoint.clone(),
            auth_token: Some("test-token".into()),
        }
    }

    async fn accept(&mut self) -> ServerConn {
        timeout(WAIT, self.accepted.recv())
            .await
            .expect("timed out waiting for connection")
            .expect("server stopped")
    }

    async fn assert_no_connection(&mut self) {
        assert!(
            timeout(QUIET, self.accepted.recv()).await.is_err(),
            "unexpected reconnect"
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn fast_config() -> EngineConfig {
    EngineConfig {
        connect_timeout_ms: 2_000,
        subscribe_timeout_ms: 2_000,
        subscribe_retry_delay_ms: 50,
        chat_timeout_ms: 2_000,
        backoff: BackoffPolicy {
            base: 2,
            unit_ms: 50,
            cap_ms: 400,
        },
        heartbeat: HeartbeatConfig {
            interval_ms: 10_000,
            max_missed_pongs: 3,
        },
        lifecycle: LifecycleConfig {
            grace_period_ms: 100,
        },
        ..EngineConfig::default()
    }
}

fn new_engine(config: EngineConfig) -> (TempDir, Engine) {
    let temp = TempDir::new().expect("tempdir");
    let engine = Engine::new(config, StorageConfig::with_root(temp.path().to_path_buf()));
    (temp, engine)
}

async fn wait_for_state(engine: &Engine, wanted: ConnectionState) {
    let mut rx = engine.watch_state();
    timeout(WAIT, async {
        loop {
            if rx.borrow_and_update().state == wanted {
                return;
            }
            rx.changed().await.expect("engine stopped");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"));
}

async fn wait_for_state_matching<F>(engine: &Engine, mut matches: F) -> ConnectionState
where
    F: FnMut(&ConnectionState) -> bool,
{
    let mut rx = engine.watch_state();
    timeout(WAIT, async {
        loop {
            let state = rx.borrow_and_update().state.clone();
            if matches(&state) {
                return state;
            }
            rx.changed().await.expect("engine stopped");
        }
    })
    .await
    .expect("timed out waiting for state")
}

async fn next_event<F>(events: &mut broadcast::Receiver<EngineEvent>, mut matches: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn connect_and_welcome(engine: &Engine, server: &mut FakeServer) -> ServerConn {
    engine.connect_to(server.target()).unwrap();
    let conn = server.accept().await;
    conn.welcome();
    wait_for_state(engine, ConnectionState::Connected).await;
    conn
}

fn subscribed_ids(envelope: &Envelope) -> Vec<String> {
    match &envelope.payload {
        Payload::Subscribe(request) => request.session_ids.clone(),
        other => panic!("expected subscribe, got {other:?}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_resubscribes_tracked_sessions() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());
    engine.track("s-2", None).unwrap();
    engine.track("s-1", None).unwrap();

    let mut conn = connect_and_welcome(&engine, &mut server).await;
    let subscribe = conn.expect("subscribe").await;
    assert_eq!(subscribed_ids(&subscribe), vec!["s-1", "s-2"]);
    match subscribe.payload {
        Payload::Subscribe(request) => assert_eq!(request.events.len(), 5),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn empty_tracked_set_still_subscribes() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());
    let mut conn = connect_and_welcome(&engine, &mut server).await;
    assert!(subscribed_ids(&conn.expect("subscribe").await).is_empty());
}

#[tokio::test]
async fn socket_open_without_welcome_is_not_connected() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());
    engine.connect_to(server.target()).unwrap();
    let mut conn = server.accept().await;

    tokio::time::sleep(QUIET).await;
    assert_eq!(engine.state().state, ConnectionState::Connecting);
    assert!(engine.send(Envelope::new(Payload::Ping)).await.is_err());
    conn.assert_silent("subscribe").await;
}

#[tokio::test]
async fn queued_requests_flush_in_order_after_handshake() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());

    let first = engine
        .send_correlated(Envelope::new(Payload::GetSessionHistory(
            tether_protocol::HistoryRequest {
                session_id: "a".into(),
                since: None,
            },
        )))
        .await
        .unwrap();
    let second = engine
        .send_correlated(Envelope::new(Payload::GetSessionHistory(
            tether_protocol::HistoryRequest {
                session_id: "b".into(),
                since: None,
            },
        )))
        .await
        .unwrap();

    let mut conn = connect_and_welcome(&engine, &mut server).await;
    let request_a = conn.expect("getSessionHistory").await;
    let request_b = conn.expect("getSessionHistory").await;
    assert_eq!(request_a.correlation_id.as_deref(), Some(first.correlation_id()));
    assert_eq!(request_b.correlation_id.as_deref(), Some(second.correlation_id()));

    let history = Payload::SessionHistory(SessionHistory {
        session_id: "a".into(),
        messages: vec![],
    });
    conn.reply(&request_a, history.clone());
    // A duplicate response for the same id is dropped.
    conn.reply(&request_a, history);
    conn.reply(
        &request_b,
        Payload::Error(ErrorInfo::new("not_found", "no such session")),
    );

    let resolved = first.wait_timeout(WAIT).await.unwrap();
    assert_eq!(resolved.type_tag(), "sessionHistory");
    assert!(matches!(
        second.wait_timeout(WAIT).await,
        Err(tether_core::SyncError::Remote { code, .. }) if code == "not_found"
    ));
}

#[tokio::test]
async fn cancelled_request_ignores_late_response() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());
    let mut conn = connect_and_welcome(&engine, &mut server).await;

    let pending = engine
        .send_correlated(Envelope::new(Payload::Ping))
        .await
        .unwrap();
    let request = conn.expect("ping").await;
    engine.cancel_request(pending.correlation_id()).unwrap();
    conn.reply(&request, Payload::Pong);

    assert!(matches!(
        pending.wait_timeout(WAIT).await,
        Err(tether_core::SyncError::RequestCancelled(_))
    ));
}

#[tokio::test]
async fn streamed_reply_is_reconstructed_and_persisted() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());
    let project = ProjectDescriptor::from_path("/code/app");
    engine.track("s-1", Some(project.clone())).unwrap();
    let mut events = engine.subscribe_events();

    let mut conn = connect_and_welcome(&engine, &mut server).await;
    conn.expect("subscribe").await;

    for fragment in [
        StreamFragment::header("Title", 1),
        StreamFragment::text("a"),
        StreamFragment::text("b"),
        StreamFragment::code("print(1)", Some("py")),
        StreamFragment::divider().finished(),
    ] {
        conn.send(Payload::StreamData(StreamData {
            session_id: "s-1".into(),
            fragment,
        }));
    }

    let completed = next_event(&mut events, |event| {
        matches!(event, EngineEvent::MessageCompleted(message) if message.session_id() == Some("s-1"))
    })
    .await;
    let EngineEvent::MessageCompleted(message) = completed else {
        unreachable!()
    };
    assert_eq!(
        message.content,
        "# Title\n\na\n\nb\n\n```py\nprint(1)\n```\n---"
    );

    let stored = timeout(WAIT, async {
        loop {
            let stored = engine.load_messages(&project.id, "s-1").await.unwrap();
            if !stored.is_empty() {
                return stored;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("message never persisted");
    assert_eq!(stored[0].id, message.id);
    assert_eq!(stored[0].streaming_state, StreamingState::Completed);
}

#[tokio::test]
async fn cancelled_stream_is_not_persisted() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());
    let project = ProjectDescriptor::from_path("/code/app");
    engine.track("s-1", Some(project.clone())).unwrap();
    let mut conn = connect_and_welcome(&engine, &mut server).await;

    engine.start_stream("s-1").await.unwrap();
    conn.send(Payload::StreamData(StreamData {
        session_id: "s-1".into(),
        fragment: StreamFragment::text("partial"),
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cancelled = engine.cancel_stream("s-1").await.unwrap().expect("in flight");
    assert_eq!(cancelled.streaming_state, StreamingState::Cancelled);
    conn.expect("abortSession").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.load_messages(&project.id, "s-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn chat_without_session_tracks_started_session() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());
    let mut conn = connect_and_welcome(&engine, &mut server).await;
    conn.expect("subscribe").await;

    let project = ProjectDescriptor::from_path("/code/app");
    let chat = {
        let project = project.clone();
        let engine = &engine;
        async move { engine.send_chat(&project, None, "run the tests").await }
    };
    let server_side = async {
        let request = conn.expect("chatCommand").await;
        match &request.payload {
            Payload::ChatCommand(command) => {
                assert_eq!(command.content, "run the tests");
                assert_eq!(command.project_path.as_deref(), Some("/code/app"));
                assert!(command.session_id.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        conn.reply(
            &request,
            Payload::SessionStarted(SessionStarted {
                session_id: "s-9".into(),
                project_path: Some("/code/app".into()),
            }),
        );
        let subscribe = conn.expect("subscribe").await;
        assert_eq!(subscribed_ids(&subscribe), vec!["s-9"]);
    };
    let (receipt, ()) = tokio::join!(chat, server_side);
    let receipt = receipt.unwrap();

    assert_eq!(receipt.session_id.as_deref(), Some("s-9"));
    assert_eq!(engine.tracked_sessions().await.unwrap(), vec!["s-9"]);

    let stored = timeout(WAIT, async {
        loop {
            let stored = engine.load_messages(&project.id, "s-9").await.unwrap();
            if !stored.is_empty() {
                return stored;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("user message never persisted");
    assert_eq!(stored[0].content, "run the tests");
}

#[tokio::test]
async fn chat_timeout_raises_notice() {
    let mut server = FakeServer::start().await;
    let config = EngineConfig {
        chat_timeout_ms: 100,
        ..fast_config()
    };
    let (_temp, engine) = new_engine(config);
    let _conn = connect_and_welcome(&engine, &mut server).await;
    let mut events = engine.subscribe_events();

    let project = ProjectDescriptor::from_path("/code/app");
    let result = engine.send_chat(&project, Some("s-1"), "hello").await;
    assert!(matches!(
        result,
        Err(tether_core::SyncError::CorrelationTimeout { .. })
    ));
    next_event(&mut events, |event| {
        matches!(event, EngineEvent::Notice(UserNotice::SendTimeout { .. }))
    })
    .await;
}

#[tokio::test]
async fn rejected_session_restarts_fresh() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());
    let mut conn = connect_and_welcome(&engine, &mut server).await;
    let mut events = engine.subscribe_events();
    let project = ProjectDescriptor::from_path("/code/app");

    let chat = engine.send_chat(&project, Some("stale"), "hello");
    let server_side = async {
        let first = conn.expect("chatCommand").await;
        conn.reply(
            &first,
            Payload::Error(ErrorInfo::new("session_not_found", "gone")),
        );
        let retry = conn.expect("chatCommand").await;
        match &retry.payload {
            Payload::ChatCommand(command) => assert!(command.session_id.is_none()),
            other => panic!("unexpected {other:?}"),
        }
        conn.reply(
            &retry,
            Payload::SessionStarted(SessionStarted {
                session_id: "fresh".into(),
                project_path: None,
            }),
        );
    };
    let (receipt, ()) = tokio::join!(chat, server_side);
    assert_eq!(receipt.unwrap().session_id.as_deref(), Some("fresh"));

    next_event(&mut events, |event| {
        matches!(event, EngineEvent::Notice(UserNotice::NoActiveSession { .. }))
    })
    .await;
    assert_eq!(engine.tracked_sessions().await.unwrap(), vec!["fresh"]);
}

#[tokio::test]
async fn unexpected_drop_reconnects_and_resubscribes() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());
    engine.track("s-1", None).unwrap();
    let mut events = engine.subscribe_events();

    let mut conn = connect_and_welcome(&engine, &mut server).await;
    conn.expect("subscribe").await;
    conn.outgoing.send(ServerOut::Drop).unwrap();

    next_event(&mut events, |event| {
        matches!(event, EngineEvent::Notice(UserNotice::ConnectionLost { .. }))
    })
    .await;

    let mut second = server.accept().await;
    second.welcome();
    wait_for_state(&engine, ConnectionState::Connected).await;
    assert_eq!(subscribed_ids(&second.expect("subscribe").await), vec!["s-1"]);
}

#[tokio::test]
async fn server_normal_close_is_not_retried() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());
    let conn = connect_and_welcome(&engine, &mut server).await;

    conn.outgoing.send(ServerOut::Close(1000)).unwrap();
    wait_for_state(&engine, ConnectionState::Disconnected).await;
    server.assert_no_connection().await;
}

#[tokio::test]
async fn deliberate_disconnect_cancels_reconnect() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());
    let conn = connect_and_welcome(&engine, &mut server).await;

    engine.disconnect().unwrap();
    wait_for_state(&engine, ConnectionState::Disconnected).await;
    drop(conn);
    server.assert_no_connection().await;
}

#[tokio::test]
async fn subscribe_failure_retries_once() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());
    engine.track("s-1", None).unwrap();
    let mut conn = connect_and_welcome(&engine, &mut server).await;

    let first = conn.expect("subscribe").await;
    conn.reply(&first, Payload::Error(ErrorInfo::new("busy", "try later")));
    let retry = conn.expect("subscribe").await;
    assert_eq!(subscribed_ids(&retry), vec!["s-1"]);
    conn.reply(&retry, Payload::Error(ErrorInfo::new("busy", "still")));
    conn.assert_silent("subscribe").await;

    // A successful answer is accepted without further traffic.
    engine.subscribe(None).unwrap();
    let again = conn.expect("subscribe").await;
    conn.reply(&again, Payload::Subscribed(Subscribed::default()));
    conn.assert_silent("subscribe").await;
}

#[tokio::test]
async fn short_background_keeps_socket() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());
    let mut conn = connect_and_welcome(&engine, &mut server).await;

    engine.lifecycle(AppTransition::Background).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.lifecycle(AppTransition::Foreground).unwrap();

    conn.assert_silent("clientBackgrounding").await;
    assert_eq!(engine.state().state, ConnectionState::Connected);
    server.assert_no_connection().await;
}

#[tokio::test]
async fn long_background_sends_one_notice() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());
    let mut conn = connect_and_welcome(&engine, &mut server).await;

    engine.lifecycle(AppTransition::Background).unwrap();
    conn.expect("clientBackgrounding").await;
    engine.lifecycle(AppTransition::Background).unwrap();
    conn.assert_silent("clientBackgrounding").await;
    assert_eq!(engine.state().state, ConnectionState::Connected);

    engine.lifecycle(AppTransition::Foreground).unwrap();
    server.assert_no_connection().await;
}

#[tokio::test]
async fn terminate_disconnects_without_retry() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());
    let _conn = connect_and_welcome(&engine, &mut server).await;

    engine.lifecycle(AppTransition::Terminate).unwrap();
    wait_for_state(&engine, ConnectionState::Disconnected).await;
    server.assert_no_connection().await;

    engine.lifecycle(AppTransition::Foreground).unwrap();
    server.accept().await;
}

#[tokio::test]
async fn unanswered_pings_force_reconnect() {
    let mut server = FakeServer::start().await;
    let config = EngineConfig {
        heartbeat: HeartbeatConfig {
            interval_ms: 50,
            max_missed_pongs: 2,
        },
        ..fast_config()
    };
    let (_temp, engine) = new_engine(config);
    let mut conn = connect_and_welcome(&engine, &mut server).await;

    conn.expect("ping").await;
    conn.expect("ping").await;
    server.accept().await;
}

#[tokio::test]
async fn uncorrelated_history_is_merged() {
    let mut server = FakeServer::start().await;
    let (_temp, engine) = new_engine(fast_config());
    let project = ProjectDescriptor::from_path("/code/app");
    engine.track("s-1", Some(project.clone())).unwrap();
    let conn = connect_and_welcome(&engine, &mut server).await;

    conn.send(Payload::SessionHistory(SessionHistory {
        session_id: "s-1".into(),
        messages: vec![HistoryMessage {
            id: "h-1".into(),
            role: "user".into(),
            content: "earlier".into(),
            timestamp: Some("2026-01-30T12:00:00.000Z".into()),
        }],
    }));

    let stored = timeout(WAIT, async {
        loop {
            let stored = engine.load_messages(&project.id, "s-1").await.unwrap();
            if !stored.is_empty() {
                return stored;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("history never merged");
    assert_eq!(stored[0].id, "h-1");
}

#[tokio::test]
async fn reset_during_backoff_still_reconnects() {
    let mut server = FakeServer::start().await;
    let config = EngineConfig {
        backoff: BackoffPolicy {
            base: 2,
            unit_ms: 500,
            cap_ms: 4_000,
        },
        ..fast_config()
    };
    let (_temp, engine) = new_engine(config);
    let mut events = engine.subscribe_events();
    let conn = connect_and_welcome(&engine, &mut server).await;

    conn.outgoing.send(ServerOut::Drop).unwrap();
    next_event(&mut events, |event| {
        matches!(event, EngineEvent::Notice(UserNotice::ConnectionLost { .. }))
    })
    .await;
    engine.reset_reconnection_state().unwrap();

    let second = server.accept().await;
    second.welcome();
    wait_for_state(&engine, ConnectionState::Connected).await;
}

#[tokio::test]
async fn backoff_at_cap_publishes_error_state() {
    let mut server = FakeServer::start().await;
    let config = EngineConfig {
        backoff: BackoffPolicy {
            base: 2,
            unit_ms: 150,
            cap_ms: 300,
        },
        ..fast_config()
    };
    let (_temp, engine) = new_engine(config);
    let conn = connect_and_welcome(&engine, &mut server).await;

    // 150ms after the first loss, then the capped 300ms once the retry is
    // dropped before its welcome.
    conn.outgoing.send(ServerOut::Drop).unwrap();
    let retry = server.accept().await;
    retry.outgoing.send(ServerOut::Drop).unwrap();

    let state = wait_for_state_matching(&engine, |state| {
        matches!(state, ConnectionState::Error(_))
    })
    .await;
    match state {
        ConnectionState::Error(message) => assert!(message.contains("retrying every")),
        other => panic!("expected error state, got {other:?}"),
    }

    // Still retrying at the capped interval.
    let third = server.accept().await;
    third.welcome();
    wait_for_state(&engine, ConnectionState::Connected).await;
}

#[tokio::test]
async fn heartbeat_pauses_beyond_grace_and_resumes_on_foreground() {
    let mut server = FakeServer::start().await;
    let config = EngineConfig {
        heartbeat: HeartbeatConfig {
            interval_ms: 50,
            max_missed_pongs: 1_000,
        },
        ..fast_config()
    };
    let (_temp, engine) = new_engine(config);
    let mut conn = connect_and_welcome(&engine, &mut server).await;
    conn.expect("ping").await;

    engine.lifecycle(AppTransition::Background).unwrap();
    conn.expect("clientBackgrounding").await;
    conn.assert_silent("ping").await;
    assert_eq!(engine.state().state, ConnectionState::Connected);

    engine.lifecycle(AppTransition::Foreground).unwrap();
    conn.expect("ping").await;
    server.assert_no_connection().await;
}

#[tokio::test]
async fn push_fetches_history_missed_since_last_stored_message() {
    let mut server = FakeServer::start().await;
    let temp = TempDir::new().expect("tempdir");
    let storage = StorageConfig::with_root(temp.path().to_path_buf());
    let project = ProjectDescriptor::from_path("/code/app");
    let last_seen = Utc
        .with_ymd_and_hms(2026, 1, 30, 12, 0, 0)
        .single()
        .expect("valid timestamp");
    PersistenceStore::new(storage.clone())
        .save(
            &project.id,
            &[Message {
                id: "seen".into(),
                content: "before going offline".into(),
                sender: Sender::Assistant,
                timestamp: last_seen,
                session_metadata: None,
                streaming_state: StreamingState::Completed,
            }],
            "s-1",
            &project,
        )
        .expect("seed history");

    let config = EngineConfig {
        endpoint: Some(server.endpoint.clone()),
        auth_token: Some("test-token".into()),
        ..fast_config()
    };
    let engine = Engine::new(config, storage);

    let mut push = BTreeMap::new();
    push.insert("sessionId".to_string(), AnyValue::from("s-1"));
    push.insert("message".to_string(), AnyValue::from("Deploy finished"));
    push.insert("messageId".to_string(), AnyValue::from("pushed"));
    push.insert("projectPath".to_string(), AnyValue::from("/code/app"));

    let serve = async {
        let mut conn = server.accept().await;
        conn.welcome();
        let request = conn.expect("getSessionHistory").await;
        conn.reply(
            &request,
            Payload::SessionHistory(SessionHistory {
                session_id: "s-1".into(),
                messages: vec![HistoryMessage {
                    id: "missed".into(),
                    role: "assistant".into(),
                    content: "while you were away".into(),
                    timestamp: Some("2026-01-30T12:05:00.000Z".into()),
                }],
            }),
        );
        request
    };
    let (outcome, request) = tokio::join!(engine.handle_push(push), serve);

    match request.payload {
        Payload::GetSessionHistory(history) => {
            assert_eq!(history.session_id, "s-1");
            assert_eq!(history.since, Some(last_seen));
        }
        other => panic!("expected getSessionHistory, got {other:?}"),
    }
    assert_eq!(
        outcome.expect("push handled"),
        PushOutcome::Stored {
            project_id: project.id.clone(),
            session_id: "s-1".into(),
            message_count: 3,
            fetched: 1,
        }
    );

    let ids: Vec<_> = engine
        .load_messages(&project.id, "s-1")
        .await
        .unwrap()
        .into_iter()
        .map(|message| message.id)
        .collect();
    assert!(ids.starts_with(&["seen".to_string(), "missed".to_string()]));
    assert!(ids.contains(&"pushed".to_string()));
    engine.shutdown().await;
}
