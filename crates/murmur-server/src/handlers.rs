//! Connection handlers for the murmur server.
//!
//! This module owns the socket side of a connection: authentication on
//! upgrade, the writer task that drains a session's outbound channel, and
//! the reader loop that feeds text frames to the core.

use crate::config::Config;
use crate::metrics::{self, ActiveConnection};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{Sink, SinkExt, StreamExt};
use murmur_core::{
    ConnectError, Connected, Core, CoreConfig, DispatchError, Outbound, SessionHandle, Store,
};
use murmur_protocol::{codec, UserId};
use murmur_store::SqliteStore;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Presence, routing and signaling.
    pub core: Core,
    /// Server configuration.
    pub config: Config,
    connections: AtomicUsize,
}

impl AppState {
    /// Create new app state over `store`.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        let core_config = CoreConfig {
            max_frame_size: config.limits.max_message_size,
        };

        Self {
            core: Core::new(store, core_config),
            config,
            connections: AtomicUsize::new(0),
        }
    }

    /// Number of sockets currently holding a permit.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }
}

/// A slot under `limits.max_connections`, released on drop.
pub struct ConnectionPermit {
    state: Arc<AppState>,
}

impl ConnectionPermit {
    /// Take a slot, or `None` if the server is full.
    pub fn try_acquire(state: &Arc<AppState>) -> Option<Self> {
        let limit = state.config.limits.max_connections;
        state
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            })
            .ok()
            .map(|_| Self {
                state: Arc::clone(state),
            })
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.state.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or the server fails
/// to start.
pub async fn run_server(config: Config) -> Result<()> {
    let storage_path = config.storage_path();
    let store = SqliteStore::open(&storage_path)
        .with_context(|| format!("Failed to open database {}", storage_path.display()))?;

    // Flags left behind by an unclean exit.
    store
        .clear_active()
        .await
        .context("Failed to reset presence flags")?;

    let state = Arc::new(AppState::new(config.clone(), Arc::new(store)));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = router(Arc::clone(&state));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("murmur server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            match shutdown_state.core.shutdown().await {
                Ok(closed) => info!(sessions = closed, "Sessions closed"),
                Err(e) => error!(error = %e, "Failed to clear presence on shutdown"),
            }
        })
        .await?;

    info!("Server stopped");
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/online", get(online_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Received SIGINT, shutting down");
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Users with a live session.
async fn online_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "users": state.core.online_users() }))
}

/// Pick the bearer credential from the `Authorization` header, falling back
/// to the `token` query parameter.
fn credential<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());

    bearer.or_else(|| query_token.map(str::trim).filter(|token| !token.is_empty()))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = credential(&headers, params.token.as_deref()) else {
        metrics::record_rejected("missing_credential");
        return (StatusCode::UNAUTHORIZED, "Missing credential").into_response();
    };

    let user_id = match state.core.store().authenticate(token).await {
        Ok(Some(user_id)) => user_id,
        Ok(None) => {
            metrics::record_rejected("invalid_credential");
            return (StatusCode::UNAUTHORIZED, "Invalid credential").into_response();
        }
        Err(e) => {
            error!(error = %e, "Credential lookup failed");
            metrics::record_error("storage");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
        }
    };

    let Some(permit) = ConnectionPermit::try_acquire(&state) else {
        warn!(user = user_id, "Connection limit reached");
        metrics::record_rejected("capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "Server full").into_response();
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, user_id, permit))
}

/// Handle an authenticated WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    user_id: UserId,
    _permit: ConnectionPermit,
) {
    let _active = ActiveConnection::open();

    let Connected {
        session,
        outbound,
        replaced,
        backlog,
    } = match state.core.connect(user_id).await {
        Ok(connected) => connected,
        Err(ConnectError::ShuttingDown) => {
            debug!(user = user_id, "Refusing session during shutdown");
            metrics::record_rejected("shutting_down");
            return;
        }
        Err(e) => {
            error!(user = user_id, error = %e, "Failed to open session");
            metrics::record_error("storage");
            return;
        }
    };

    let connection_id = session.connection_id();
    debug!(
        user = user_id,
        connection = connection_id,
        replaced,
        backlog,
        "WebSocket connected"
    );

    let (sender, mut receiver) = socket.split();
    let heartbeat = Duration::from_millis(state.config.heartbeat.interval_ms.max(1));
    let mut writer = tokio::spawn(write_loop(sender, outbound, heartbeat));

    // Backlog items are confirmed by the writer, so it must be running first.
    match state.core.flush_offline(&session).await {
        Ok(flushed) => metrics::record_flushed(flushed.delivered),
        Err(e) => {
            warn!(user = user_id, error = %e, "Offline flush failed");
            metrics::record_error("storage");
        }
    }

    loop {
        tokio::select! {
            // The writer stops once the session is closed or the socket fails.
            _ = &mut writer => {
                debug!(user = user_id, connection = connection_id, "Writer finished");
                break;
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_text(&state, &session, &text).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!(user = user_id, bytes = data.len(), "Dropping binary frame");
                        metrics::record_dropped("binary");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(user = user_id, connection = connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(
                            user = user_id,
                            connection = connection_id,
                            error = %e,
                            "WebSocket error"
                        );
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(
                            user = user_id,
                            connection = connection_id,
                            "WebSocket stream ended"
                        );
                        break;
                    }
                }
            }
        }
    }

    writer.abort();

    if let Err(e) = state.core.disconnect(&session).await {
        warn!(user = user_id, error = %e, "Failed to clear presence");
        metrics::record_error("storage");
    }

    debug!(user = user_id, connection = connection_id, "WebSocket disconnected");
}

/// Feed one text frame to the core and record what it did.
async fn dispatch_text(state: &AppState, session: &SessionHandle, text: &str) {
    let start = Instant::now();
    metrics::record_frame("text", text.len(), "inbound");

    match state.core.dispatch(text, session).await {
        Ok(dispatched) => metrics::record_dispatched(&dispatched),
        Err(DispatchError::Malformed(_)) => metrics::record_dropped("malformed"),
        Err(e) => metrics::record_error(e.kind()),
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
}

/// Drain a session's outbound channel into the socket.
///
/// Tracked frames are confirmed only after the socket accepted them.
async fn write_loop<S>(
    mut sender: S,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    heartbeat: Duration,
) where
    S: Sink<Message> + Unpin,
{
    let mut ticker = tokio::time::interval(heartbeat);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let (frame, written) = match next {
                    Some(Outbound::Frame(frame)) => (frame, None),
                    Some(Outbound::Tracked { frame, written }) => (frame, Some(written)),
                    Some(Outbound::Close) | None => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                };

                let text = match codec::encode(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(frame = frame.kind(), error = %e, "Failed to encode frame");
                        metrics::record_error("encode");
                        continue;
                    }
                };
                metrics::record_frame(frame.kind(), text.len(), "outbound");
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
                if let Some(written) = written {
                    // The flush may already have given up on this item.
                    let _ = written.send(());
                }
            }

            _ = ticker.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}
