//! Axum-based HTTP gateway for the relay.
//!
//! Routes:
//! - `GET  /health`             — liveness plus live session count
//! - `POST /api/auth/register`  — store credentials
//! - `POST /api/auth/login`     — verify credentials, issue a bearer token
//! - `GET  /ws`                 — bearer-gated WebSocket echo session
//!
//! Plain HTTP handlers run behind a body size limit and a request timeout.
//! Upgraded sessions outlive the request and are governed by
//! [`session::SessionPolicy`] instead.

pub mod error;
pub mod session;

pub use error::GatewayError;
pub use session::{SessionPolicy, SessionRegistry};

use crate::auth::{create_credential_store, Credentials, PasswordHasher, TokenService};
use crate::config::{Config, GatewayConfig};
use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// How long shutdown waits for sessions to finish their close handshake.
const SHUTDOWN_GRACE_SECS: u64 = 5;

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub credentials: Arc<Credentials>,
    pub tokens: Arc<TokenService>,
    pub sessions: Arc<SessionRegistry>,
    pub session_policy: SessionPolicy,
}

impl AppState {
    pub fn new(credentials: Credentials, tokens: TokenService, session_policy: SessionPolicy) -> Self {
        Self {
            credentials: Arc::new(credentials),
            tokens: Arc::new(tokens),
            sessions: Arc::new(SessionRegistry::new()),
            session_policy,
        }
    }

    /// Wire up the credential backend, token service and session policy
    /// named by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = create_credential_store(&config.credentials)?;
        let credentials = Credentials::new(store, PasswordHasher::new(config.auth.password_iterations));
        let users = credentials.store().count()?;
        tracing::info!(
            backend = credentials.store().name(),
            users,
            "Credential store initialized"
        );
        let tokens = TokenService::from_config(&config.auth)?;
        Ok(Self::new(
            credentials,
            tokens,
            SessionPolicy::from(&config.session),
        ))
    }
}

/// Build the router with middleware.
pub fn build_router(state: AppState, gateway: &GatewayConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/auth/register", post(handle_register))
        .route("/api/auth/login", post(handle_login))
        .route("/ws", get(handle_session))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(gateway.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(gateway.request_timeout_secs),
        ))
}

/// Run the gateway until SIGINT/SIGTERM.
pub async fn run_gateway(config: Config) -> Result<()> {
    let state = AppState::from_config(&config)?;

    let listener =
        tokio::net::TcpListener::bind((config.gateway.host.as_str(), config.gateway.port))
            .await
            .with_context(|| {
                format!(
                    "Failed to bind {}:{}",
                    config.gateway.host, config.gateway.port
                )
            })?;
    let local = listener.local_addr()?;

    println!("🦀 echorelay listening on http://{local}");
    println!("  GET  /health             — health check");
    println!("  POST /api/auth/register  — {{\"username\", \"password\"}}");
    println!("  POST /api/auth/login     — returns access_token");
    println!("  GET  /ws                 — WebSocket echo (Authorization: Bearer <token>)");
    println!("  Press Ctrl+C to stop.\n");
    tracing::info!(%local, "Gateway listening");

    serve(listener, state, &config.gateway, shutdown_signal()).await
}

/// Serve on an already-bound listener until `shutdown` resolves, then close
/// every live session.
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    state: AppState,
    gateway: &GatewayConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let sessions = Arc::clone(&state.sessions);
    let app = build_router(state, gateway);

    let signal_sessions = Arc::clone(&sessions);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!(
                active = signal_sessions.active(),
                "Shutdown requested, closing sessions"
            );
            signal_sessions.shutdown();
        })
        .await?;

    // Upgraded connections are detached from the server; wait for their close handshakes.
    sessions.shutdown();
    if !sessions
        .wait_idle(Duration::from_secs(SHUTDOWN_GRACE_SECS))
        .await
    {
        tracing::warn!(
            active = sessions.active(),
            "Sessions still open after shutdown grace period"
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health — always public
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.active(),
    }))
}

/// Request body for register and login.
#[derive(Deserialize)]
struct CredentialsBody {
    username: String,
    password: String,
}

fn decode_body(
    body: Result<Json<CredentialsBody>, JsonRejection>,
) -> Result<CredentialsBody, GatewayError> {
    body.map(|Json(b)| b)
        .map_err(|e| GatewayError::InvalidRequest(e.body_text()))
}

/// POST /api/auth/register — store (or overwrite) credentials.
async fn handle_register(
    State(state): State<AppState>,
    body: Result<Json<CredentialsBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let CredentialsBody { username, password } = decode_body(body)?;

    let credentials = Arc::clone(&state.credentials);
    tokio::task::spawn_blocking(move || credentials.register(&username, &password)).await??;

    Ok(Json(serde_json::json!({"status": "registered"})))
}

/// POST /api/auth/login — verify credentials and issue a bearer token.
async fn handle_login(
    State(state): State<AppState>,
    body: Result<Json<CredentialsBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let CredentialsBody { username, password } = decode_body(body)?;

    let credentials = Arc::clone(&state.credentials);
    let subject = username.clone();
    let valid =
        tokio::task::spawn_blocking(move || credentials.verify(&username, &password)).await??;
    if !valid {
        tracing::debug!(username = %subject, "Login rejected");
        return Err(GatewayError::InvalidCredentials);
    }

    let token = state
        .tokens
        .issue(&subject)
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    tracing::info!(username = %subject, "Token issued");

    Ok(Json(serde_json::json!({
        "access_token": token,
        "token_type": "Bearer",
        "expires_in": state.tokens.ttl_secs(),
    })))
}

/// GET /ws — authenticate, then upgrade to a WebSocket echo session.
///
/// The token is checked before the upgrade extractor's result is looked at,
/// so a bad token is always `401` and a good token on a non-upgradable
/// request is `426`.
async fn handle_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, GatewayError> {
    let session = session::PendingSession::from_headers(&headers).authenticate(&state.tokens)?;
    let ws = upgrade.map_err(|e| GatewayError::UpgradeFailed(e.body_text()))?;

    Ok(session.upgrade(
        ws,
        Arc::clone(&state.sessions),
        state.session_policy.clone(),
    ))
}
