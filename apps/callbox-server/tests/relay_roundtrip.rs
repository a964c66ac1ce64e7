use std::{net::SocketAddr, sync::Arc, time::Duration};

use callbox_core::{ConnectionId, EndReason, ErrorKind, ServerMessage};
use callbox_server::{config::ServerConfig, AppState};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

const FRAME_WAIT: Duration = Duration::from_secs(5);

async fn spawn_relay() -> (SocketAddr, Arc<AppState>) {
    let config = ServerConfig::default();
    let metrics = PrometheusBuilder::new().build_recorder().handle();
    let state = AppState::new(&config, metrics);
    let app = callbox_server::app(state.clone(), &config.allowed_origins);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });
    (addr, state)
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    id: ConnectionId,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");
        let mut client = Self {
            ws,
            id: ConnectionId::new(),
        };
        match client.recv().await {
            ServerMessage::Identity { connection_id } => client.id = connection_id,
            other => panic!("expected identity, got {other:?}"),
        }
        client
    }

    async fn register(addr: SocketAddr, user_id: &str, display_name: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client
            .send(json!({"type": "register", "userId": user_id, "displayName": display_name}))
            .await;
        let me = client.id;
        client
            .recv_until(|frame| {
                matches!(frame, ServerMessage::UserList { users }
                    if users.iter().any(|user| user.connection_id == me))
            })
            .await;
        client
    }

    async fn send(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .expect("send");
    }

    async fn recv(&mut self) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(FRAME_WAIT, self.ws.next())
                .await
                .expect("frame before timeout")
                .expect("stream open")
                .expect("websocket frame");
            if let Message::Text(text) = frame {
                return serde_json::from_str(text.as_str()).expect("server frame");
            }
        }
    }

    async fn recv_until(&mut self, wanted: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        loop {
            let frame = self.recv().await;
            if wanted(&frame) {
                return frame;
            }
        }
    }

    /// Next frame that is not a user-list broadcast.
    async fn recv_signal(&mut self) -> ServerMessage {
        self.recv_until(|frame| !matches!(frame, ServerMessage::UserList { .. }))
            .await
    }
}

fn offer() -> Value {
    json!({"type": "offer", "sdp": "v=0 offer"})
}

#[test_timeout::tokio_timeout_test]
async fn full_call_over_real_sockets() {
    let (addr, state) = spawn_relay().await;
    let mut alice = Client::register(addr, "u1", "Alice").await;
    let mut bob = Client::register(addr, "u2", "Bob").await;

    alice
        .send(json!({"type": "initiate-call", "targetUserId": "u2", "offer": offer()}))
        .await;
    match bob.recv_signal().await {
        ServerMessage::IncomingCall {
            from,
            display_name,
            signal,
            ..
        } => {
            assert_eq!(from, alice.id);
            assert_eq!(display_name, "Alice");
            assert_eq!(signal.sdp, "v=0 offer");
        }
        other => panic!("expected incoming-call, got {other:?}"),
    }

    for n in 0..3 {
        alice
            .send(json!({"type": "signal", "candidate": format!("cand-{n}"), "sdpMid": "0"}))
            .await;
    }
    bob.send(json!({
        "type": "answer-call",
        "to": alice.id.to_string(),
        "answer": {"type": "answer", "sdp": "v=0 answer"}
    }))
    .await;

    assert!(matches!(
        alice.recv_signal().await,
        ServerMessage::CallAccepted { from, .. } if from == bob.id
    ));
    for n in 0..3 {
        match bob.recv_signal().await {
            ServerMessage::IceCandidate { from, candidate } => {
                assert_eq!(from, alice.id);
                assert_eq!(candidate.candidate, format!("cand-{n}"));
            }
            other => panic!("expected ice-candidate, got {other:?}"),
        }
    }

    bob.send(json!({"type": "ice-candidate", "candidate": "from-bob"}))
        .await;
    assert!(matches!(
        alice.recv_signal().await,
        ServerMessage::IceCandidate { candidate, .. } if candidate.candidate == "from-bob"
    ));
    assert_eq!(state.router.stats().calls_connected, 1);

    alice.send(json!({"type": "leave-call", "to": "u2"})).await;
    assert_eq!(
        bob.recv_signal().await,
        ServerMessage::CallEnded {
            from: alice.id,
            reason: EndReason::HangUp,
        }
    );
}

#[test_timeout::tokio_timeout_test]
async fn calling_an_unknown_user_returns_an_error() {
    let (addr, _state) = spawn_relay().await;
    let mut alice = Client::register(addr, "u1", "Alice").await;

    alice
        .send(json!({"type": "initiate-call", "targetUserId": "ghost", "offer": offer()}))
        .await;
    assert!(matches!(
        alice.recv_signal().await,
        ServerMessage::Error { kind: ErrorKind::TargetNotFound, .. }
    ));
}

#[test_timeout::tokio_timeout_test]
async fn dropping_a_socket_ends_the_call_for_the_peer() {
    let (addr, state) = spawn_relay().await;
    let mut alice = Client::register(addr, "u1", "Alice").await;
    let mut bob = Client::register(addr, "u2", "Bob").await;

    alice
        .send(json!({"type": "initiate-call", "targetUserId": "u2", "offer": offer()}))
        .await;
    bob.recv_signal().await;

    let alice_id = alice.id;
    alice.ws.close(None).await.expect("close");
    drop(alice);

    assert_eq!(
        bob.recv_signal().await,
        ServerMessage::CallEnded {
            from: alice_id,
            reason: EndReason::PeerDisconnected,
        }
    );
    let listing = bob
        .recv_until(|frame| matches!(frame, ServerMessage::UserList { .. }))
        .await;
    assert!(matches!(listing, ServerMessage::UserList { users } if users.len() == 1));
    assert_eq!(state.router.stats().calls_offering, 0);
}

#[test_timeout::tokio_timeout_test]
async fn junk_frames_do_not_close_the_connection() {
    let (addr, _state) = spawn_relay().await;
    let mut client = Client::connect(addr).await;

    client.send(json!({"type": "typing"})).await;
    client.send(json!({"type": "register"})).await;
    client
        .ws
        .send(Message::Text("not json".into()))
        .await
        .expect("send");
    client
        .ws
        .send(Message::Binary(
            json!({"type": "get-users"}).to_string().into_bytes().into(),
        ))
        .await
        .expect("send");

    assert_eq!(
        client.recv().await,
        ServerMessage::UserList { users: Vec::new() }
    );
}

#[test_timeout::tokio_timeout_test]
async fn shutdown_ends_calls_on_both_sides() {
    let (addr, state) = spawn_relay().await;
    let mut alice = Client::register(addr, "u1", "Alice").await;
    let mut bob = Client::register(addr, "u2", "Bob").await;

    alice
        .send(json!({"type": "initiate-call", "targetUserId": "u2", "offer": offer()}))
        .await;
    bob.recv_signal().await;

    assert_eq!(state.router.shutdown(), 1);
    for client in [&mut alice, &mut bob] {
        assert!(matches!(
            client.recv_signal().await,
            ServerMessage::CallEnded { reason: EndReason::Shutdown, .. }
        ));
    }
}
