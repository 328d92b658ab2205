//! Authenticated WebSocket sessions.
//!
//! A connection moves through two states:
//!
//! 1. [`PendingSession`]: the request has arrived; the only thing it can do
//!    is present its bearer token.
//! 2. [`AuthenticatedSession`]: the token validated. Only this type can
//!    perform the WebSocket upgrade, so there is no path to an upgraded
//!    connection that skipped validation.
//!
//! Once upgraded, the session runs [`run_echo_loop`] until the peer closes,
//! the transport fails, the idle timeout fires, or the process shuts down.
//! The token is not re-checked after the upgrade.

use super::error::GatewayError;
use crate::auth::TokenService;
use crate::config::SessionConfig;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;

/// The transport buffers messages up to this multiple of the policy limit;
/// anything larger is a transport error rather than a 1009 close.
const TRANSPORT_LIMIT_FACTOR: usize = 4;

/// Per-session limits applied at upgrade time.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// `None` means a session may stay silent indefinitely.
    pub idle_timeout: Option<Duration>,
    /// Largest text or binary payload that is echoed. Larger messages close
    /// the session with 1009.
    pub max_message_bytes: usize,
}

impl SessionPolicy {
    fn transport_limit(&self) -> usize {
        self.max_message_bytes.saturating_mul(TRANSPORT_LIMIT_FACTOR)
    }
}

impl From<&SessionConfig> for SessionPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            idle_timeout: (config.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(config.idle_timeout_secs)),
            max_message_bytes: config.max_message_bytes,
        }
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

/// Bearer token from the `Authorization` header.
///
/// The `Bearer ` prefix is stripped when present; otherwise the whole header
/// value is returned as the candidate and left for validation to reject.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    Some(value.strip_prefix("Bearer ").map_or(value, str::trim))
}

/// A connection request that has not yet proven who it is.
pub struct PendingSession<'a> {
    candidate: Option<&'a str>,
}

impl<'a> PendingSession<'a> {
    pub fn from_headers(headers: &'a HeaderMap) -> Self {
        Self {
            candidate: extract_bearer_token(headers),
        }
    }

    /// Validate the presented token. Every failure is `Unauthorized`; the
    /// specific reason only reaches the debug log.
    pub fn authenticate(self, tokens: &TokenService) -> Result<AuthenticatedSession, GatewayError> {
        let Some(token) = self.candidate.filter(|t| !t.is_empty()) else {
            tracing::debug!("Session rejected: no bearer token");
            return Err(GatewayError::Unauthorized);
        };

        match tokens.validate(token) {
            Ok(claims) => Ok(AuthenticatedSession {
                subject: claims.sub,
                token_expires_at: claims.exp,
            }),
            Err(reason) => {
                tracing::debug!(%reason, "Session rejected: token validation failed");
                Err(GatewayError::Unauthorized)
            }
        }
    }
}

/// A request whose token validated; it may now be upgraded.
#[derive(Debug)]
pub struct AuthenticatedSession {
    subject: String,
    token_expires_at: i64,
}

impl AuthenticatedSession {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Complete the upgrade and hand the socket to the echo loop.
    pub fn upgrade(
        self,
        ws: WebSocketUpgrade,
        registry: Arc<SessionRegistry>,
        policy: SessionPolicy,
    ) -> Response {
        let Self {
            subject,
            token_expires_at,
        } = self;

        ws.max_message_size(policy.transport_limit())
            .on_failed_upgrade(|err| {
                tracing::warn!(error = %err, "WebSocket upgrade failed after authentication");
            })
            .on_upgrade(move |socket| {
                let session = registry.open(subject);
                tracing::info!(
                    session_id = session.id(),
                    subject = session.subject(),
                    token_expires_at,
                    "Session opened"
                );
                run_session(socket, session, policy)
            })
    }
}

async fn run_session(mut socket: WebSocket, session: Session, policy: SessionPolicy) {
    let end = run_echo_loop(&mut socket, &policy, session.shutdown_token()).await;
    let _ = socket.close().await;
    session.finish(&end);
}

// ── Echo loop ───────────────────────────────────────────────────────

/// Read/write failure on an established session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
}

/// Why a session's loop exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    PeerClosed,
    IdleTimeout,
    Shutdown,
    MessageTooBig { size: usize },
    Transport(TransportError),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed"),
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::Shutdown => f.write_str("server shutdown"),
            Self::MessageTooBig { size } => write!(f, "message too big ({size} bytes)"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
        }
    }
}

/// Echo every text or binary frame back to the sender, in order, with its
/// tag and bytes unchanged.
///
/// Returns when the peer closes, a read or write fails, no frame arrives
/// within the idle timeout, a message exceeds `max_message_bytes`, or
/// `shutdown` is cancelled. The last three send a Close frame first. The
/// caller owns the socket and releases it.
pub async fn run_echo_loop<S, E>(
    socket: &mut S,
    policy: &SessionPolicy,
    shutdown: &CancellationToken,
) -> SessionEnd
where
    S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Unpin,
    E: fmt::Display,
{
    loop {
        let inbound = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                send_close(socket, close_code::AWAY, "server shutting down").await;
                return SessionEnd::Shutdown;
            }
            inbound = next_frame(socket, policy.idle_timeout) => inbound,
        };

        let frame = match inbound {
            Err(_elapsed) => {
                send_close(socket, close_code::NORMAL, "idle timeout").await;
                return SessionEnd::IdleTimeout;
            }
            Ok(None) => return SessionEnd::PeerClosed,
            Ok(Some(Err(err))) => {
                return SessionEnd::Transport(TransportError::Read(err.to_string()));
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let size = match &frame {
            Message::Text(text) => text.len(),
            Message::Binary(bytes) => bytes.len(),
            _ => 0,
        };
        if size > policy.max_message_bytes {
            send_close(socket, close_code::SIZE, "message too big").await;
            return SessionEnd::MessageTooBig { size };
        }

        match frame {
            Message::Text(_) | Message::Binary(_) => {
                if let Err(err) = socket.send(frame).await {
                    return SessionEnd::Transport(TransportError::Write(err.to_string()));
                }
            }
            Message::Close(_) => return SessionEnd::PeerClosed,
            // answered by the transport
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn next_frame<S>(
    socket: &mut S,
    idle_timeout: Option<Duration>,
) -> Result<Option<S::Item>, tokio::time::error::Elapsed>
where
    S: Stream + Unpin,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, socket.next()).await,
        None => Ok(socket.next().await),
    }
}

async fn send_close<S>(socket: &mut S, code: u16, reason: &'static str)
where
    S: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

// ── Registry ────────────────────────────────────────────────────────

/// Tracks live sessions and carries the process-wide shutdown signal.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly upgraded session. The slot is released when the
    /// returned [`Session`] is dropped.
    pub fn open(self: &Arc<Self>, subject: String) -> Session {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Session {
            id,
            subject,
            opened_at: Instant::now(),
            registry: Arc::clone(self),
            _slot: self.tracker.token(),
        }
    }

    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Ask every live session to close.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait until no sessions are live. Returns `false` if `limit` elapsed
    /// first. Only meaningful once the server has stopped accepting upgrades.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(limit, self.tracker.wait()).await.is_ok()
    }
}

/// One live upgraded connection.
pub struct Session {
    id: u64,
    subject: String,
    opened_at: Instant,
    registry: Arc<SessionRegistry>,
    /// Counts toward [`SessionRegistry::active`] until dropped.
    _slot: TaskTrackerToken,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.registry.shutdown
    }

    fn finish(self, end: &SessionEnd) {
        let duration_ms = self.opened_at.elapsed().as_millis() as u64;
        match end {
            SessionEnd::Transport(err) => tracing::warn!(
                session_id = self.id,
                subject = %self.subject,
                duration_ms,
                error = %err,
                "Session terminated by transport error"
            ),
            other => tracing::info!(
                session_id = self.id,
                subject = %self.subject,
                duration_ms,
                reason = %other,
                "Session closed"
            ),
        }
    }
}
