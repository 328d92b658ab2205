//! End-to-end relay tests against a real listener and WebSocket client.

use echorelay::auth::{Credentials, MemoryCredentialStore, PasswordHasher, TokenService};
use echorelay::config::GatewayConfig;
use echorelay::gateway::{self, AppState, SessionPolicy};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET: &[u8] = b"relay-e2e-secret-relay-e2e-secret";
const STEP: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Relay {
    addr: SocketAddr,
    state: AppState,
    stop: Option<oneshot::Sender<()>>,
    server: JoinHandle<anyhow::Result<()>>,
}

impl Relay {
    async fn start(policy: SessionPolicy) -> Self {
        let state = AppState::new(
            Credentials::new(
                Arc::new(MemoryCredentialStore::new()),
                PasswordHasher::new(1_000),
            ),
            TokenService::new(SECRET, 3600),
            policy,
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let server_state = state.clone();
        let server = tokio::spawn(async move {
            gateway::serve(listener, server_state, &GatewayConfig::default(), async {
                let _ = stopped.await;
            })
            .await
        });
        Self {
            addr,
            state,
            stop: Some(stop),
            server,
        }
    }

    fn token_for(&self, username: &str, password: &str) -> String {
        self.state.credentials.register(username, password).unwrap();
        assert!(self.state.credentials.verify(username, password).unwrap());
        self.state.tokens.issue(username).unwrap()
    }

    async fn connect(&self, authorization: Option<&str>) -> Result<Client, WsError> {
        let mut request = format!("ws://{}/ws", self.addr)
            .into_client_request()
            .unwrap();
        if let Some(value) = authorization {
            request
                .headers_mut()
                .insert("Authorization", value.parse().unwrap());
        }
        connect_async(request).await.map(|(ws, _)| ws)
    }

    async fn wait_for_active(&self, expected: usize) {
        tokio::time::timeout(STEP, async {
            while self.state.sessions.active() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("active sessions never reached {expected}"));
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), self.server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

async fn next_message(client: &mut Client) -> Message {
    tokio::time::timeout(STEP, client.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .expect("read failed")
}

fn policy(idle_timeout: Option<Duration>) -> SessionPolicy {
    SessionPolicy {
        idle_timeout,
        ..SessionPolicy::default()
    }
}

fn assert_rejected_with(result: Result<Client, WsError>, status: u16) {
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), status),
        Err(other) => panic!("expected HTTP {status}, got {other}"),
        Ok(_) => panic!("expected HTTP {status}, connection was upgraded"),
    }
}

#[tokio::test]
async fn echoes_text_and_binary_in_order() {
    let relay = Relay::start(policy(None)).await;
    let token = relay.token_for("alice", "secret1");
    let mut client = relay.connect(Some(&format!("Bearer {token}"))).await.unwrap();

    let sent = vec![
        Message::text("hello"),
        Message::binary(vec![0u8, 1, 2, 255]),
        Message::text("wörld"),
        Message::text(""),
    ];
    for frame in &sent {
        client.send(frame.clone()).await.unwrap();
    }
    for frame in &sent {
        assert_eq!(&next_message(&mut client).await, frame);
    }

    client.close(None).await.unwrap();
    relay.wait_for_active(0).await;
    relay.stop().await;
}

#[tokio::test]
async fn rejects_missing_and_invalid_tokens() {
    let relay = Relay::start(policy(None)).await;
    assert_rejected_with(relay.connect(None).await, 401);
    assert_rejected_with(relay.connect(Some("Bearer invalidtoken")).await, 401);

    let foreign = TokenService::new(b"not-the-relay-secret-not-the-relay", 3600)
        .issue("alice")
        .unwrap();
    assert_rejected_with(relay.connect(Some(&format!("Bearer {foreign}"))).await, 401);

    let expired = relay
        .state
        .tokens
        .issue_at("alice", chrono::Utc::now().timestamp() - 7200)
        .unwrap();
    assert_rejected_with(relay.connect(Some(&format!("Bearer {expired}"))).await, 401);

    assert_eq!(relay.state.sessions.active(), 0);
    relay.stop().await;
}

#[tokio::test]
async fn sessions_are_independent() {
    let relay = Relay::start(policy(None)).await;
    let alice = relay.token_for("alice", "pw-a");
    let bob = relay.token_for("bob", "pw-b");

    let mut first = relay.connect(Some(&format!("Bearer {alice}"))).await.unwrap();
    let mut second = relay.connect(Some(&format!("Bearer {bob}"))).await.unwrap();
    relay.wait_for_active(2).await;

    first.send(Message::text("from alice")).await.unwrap();
    second.send(Message::text("from bob")).await.unwrap();
    assert_eq!(next_message(&mut first).await, Message::text("from alice"));
    assert_eq!(next_message(&mut second).await, Message::text("from bob"));

    first.close(None).await.unwrap();
    relay.wait_for_active(1).await;

    second.send(Message::text("still here")).await.unwrap();
    assert_eq!(next_message(&mut second).await, Message::text("still here"));

    second.close(None).await.unwrap();
    relay.wait_for_active(0).await;
    relay.stop().await;
}

#[tokio::test]
async fn idle_session_is_closed_normally() {
    let relay = Relay::start(policy(Some(Duration::from_millis(200)))).await;
    let token = relay.token_for("alice", "secret1");
    let mut client = relay.connect(Some(&format!("Bearer {token}"))).await.unwrap();

    match next_message(&mut client).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Normal);
            assert_eq!(frame.reason.as_str(), "idle timeout");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
    relay.wait_for_active(0).await;
    relay.stop().await;
}

#[tokio::test]
async fn shutdown_closes_live_sessions() {
    let relay = Relay::start(policy(None)).await;
    let token = relay.token_for("alice", "secret1");
    let mut client = relay.connect(Some(&format!("Bearer {token}"))).await.unwrap();
    relay.wait_for_active(1).await;

    relay.state.sessions.shutdown();
    match next_message(&mut client).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected close frame, got {other:?}"),
    }
    relay.wait_for_active(0).await;
    relay.stop().await;
}

fn small_messages() -> SessionPolicy {
    SessionPolicy {
        idle_timeout: None,
        max_message_bytes: 16,
    }
}

#[tokio::test]
async fn oversized_message_closes_with_message_too_big() {
    let relay = Relay::start(small_messages()).await;
    let token = relay.token_for("alice", "secret1");
    let mut client = relay.connect(Some(&format!("Bearer {token}"))).await.unwrap();
    relay.wait_for_active(1).await;

    client.send(Message::text("small")).await.unwrap();
    assert_eq!(next_message(&mut client).await, Message::text("small"));

    client.send(Message::text("x".repeat(40))).await.unwrap();
    match next_message(&mut client).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Size);
            assert_eq!(frame.reason.as_str(), "message too big");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
    relay.wait_for_active(0).await;
    relay.stop().await;
}

#[tokio::test]
async fn message_beyond_transport_limit_releases_session() {
    let relay = Relay::start(small_messages()).await;
    let token = relay.token_for("alice", "secret1");
    let mut client = relay.connect(Some(&format!("Bearer {token}"))).await.unwrap();
    relay.wait_for_active(1).await;

    client.send(Message::text("x".repeat(100))).await.unwrap();
    relay.wait_for_active(0).await;

    // Whatever the transport reports, no echo ever arrives.
    if let Ok(Some(Ok(frame))) = tokio::time::timeout(STEP, client.next()).await {
        assert!(frame.is_close(), "unexpected frame {frame:?}");
    }
    relay.stop().await;
}
