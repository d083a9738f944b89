//! Signaling Broker (spec.md §4.5): accepts WebSocket upgrades, assigns
//! client ids, notifies existing clients when a new one joins, and routes
//! offer/answer/candidate messages by `clientId`/`fromClientId`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{envelope, error::AppError, metrics};

const OUTBOX_CAPACITY: usize = 32;
const PING_INTERVAL: Duration = Duration::from_secs(55);
const PONG_TIMEOUT: Duration = Duration::from_secs(130);

struct Client {
    tx: mpsc::Sender<Message>,
    disconnect: Arc<tokio::sync::Notify>,
}

/// The broker's client table plus its id counter, held behind one lock so
/// id assignment is atomic with insertion (spec.md §4.5).
struct Registry {
    next_id: AtomicU64,
    clients: RwLock<HashMap<String, Client>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            clients: RwLock::new(HashMap::new()),
        }
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    allowed_origins: Arc<Vec<String>>,
    dev_mode: bool,
}

/// Builds the broker's axum router: `GET /ws` upgrades to the signaling
/// WebSocket, `GET /health` is a dependency-free liveness check, `GET
/// /metrics` exposes the prometheus registry. Exposed separately from
/// `serve` so tests can exercise it with `axum::serve` over an ephemeral
/// port without going through `Config::from_env`.
pub fn router(allowed_origins: Vec<String>, dev_mode: bool) -> Router {
    let state = AppState {
        registry: Arc::new(Registry::new()),
        allowed_origins: Arc::new(allowed_origins),
        dev_mode,
    };

    // The websocket upgrade route is kept off the body-buffering request/
    // response logger: that middleware collects the full response body,
    // which would defeat the 101 Switching Protocols hijack.
    let observed = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(axum::middleware::from_fn(http_log::print_request_response));

    // `/health` and `/metrics` are polled by infrastructure that may run on
    // a different origin than the viewer page; `/ws`'s own origin check
    // (above) is the actual access control, so CORS here is permissive.
    Router::new()
        .route("/ws", get(ws_handler))
        .merge(observed)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the broker on `listener` until `shutdown` resolves, per spec.md
/// §5's shutdown discipline (normal-closure shutdown happens per-connection
/// as each client's writer task closes its sink).
pub async fn serve(
    listener: TcpListener,
    allowed_origins: Vec<String>,
    dev_mode: bool,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(allowed_origins, dev_mode);
    info!(addr = %listener.local_addr()?, "signaling broker listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::encode(),
    )
}

/// Origin policy (spec.md §4.5): no `Origin` header → accept (internal
/// clients); a configured allowed origin → accept; `localhost`/`127.0.0.1`
/// in development mode → accept; anything else → refused.
fn origin_allowed(headers: &HeaderMap, allowed: &[String], dev_mode: bool) -> bool {
    let Some(origin) = headers.get(axum::http::header::ORIGIN) else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    if allowed.iter().any(|o| o == origin) {
        return true;
    }
    if dev_mode && (origin.contains("localhost") || origin.contains("127.0.0.1")) {
        return true;
    }
    false
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !origin_allowed(&headers, &state.allowed_origins, state.dev_mode) {
        warn!("rejected websocket upgrade from disallowed origin");
        return AppError::forbidden("origin not allowed").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state)).into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOX_CAPACITY);

    let disconnect = Arc::new(tokio::sync::Notify::new());
    let id = {
        let mut clients = state.registry.clients.write().await;
        let id = format!("client-{}", state.registry.next_id.fetch_add(1, Ordering::SeqCst));
        clients.insert(
            id.clone(),
            Client {
                tx: tx.clone(),
                disconnect: disconnect.clone(),
            },
        );
        metrics::CLIENTS_REGISTERED.set(clients.len() as f64);
        id
    };
    info!("[{id}] client registered");

    notify_viewer_connected(&state, &id).await;

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let last_pong = Arc::new(std::sync::Mutex::new(Instant::now()));
    let ping_tx = tx.clone();
    let ping_last_pong = last_pong.clone();
    let ping_id = id.clone();
    let ping_disconnect = disconnect.clone();
    let pinger = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            if ping_last_pong.lock().unwrap().elapsed() > PONG_TIMEOUT {
                warn!("[{ping_id}] missed pong, disconnecting");
                ping_disconnect.notify_one();
                break;
            }
            if ping_tx.send(Message::Ping(Vec::new())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("[{id}] websocket read error: {e}");
                        break;
                    }
                };
                match msg {
                    Message::Text(text) => route_message(&state, &id, &text).await,
                    Message::Pong(_) => {
                        *last_pong.lock().unwrap() = Instant::now();
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = disconnect.notified() => {
                break;
            }
        }
    }

    pinger.abort();
    writer.abort();
    let mut clients = state.registry.clients.write().await;
    clients.remove(&id);
    metrics::CLIENTS_REGISTERED.set(clients.len() as f64);
    info!("[{id}] client disconnected");
}

async fn notify_viewer_connected(state: &AppState, new_id: &str) {
    let clients = state.registry.clients.read().await;
    if clients.len() <= 1 {
        return;
    }
    let payload = envelope::viewer_connected(new_id);
    broadcast_to_others(&clients, new_id, &payload).await;
}

async fn route_message(state: &AppState, sender_id: &str, text: &str) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        warn!("[{sender_id}] failed to parse signaling message as JSON");
        return;
    };
    if envelope::message_type(&value) == Some(envelope::TYPE_VIEWER_CONNECTED) {
        // Clients never originate this type; it is broker-synthesised only.
        return;
    }
    let stamped = envelope::stamp_routing_fields(value, sender_id);
    let clients = state.registry.clients.read().await;
    broadcast_to_others(&clients, sender_id, &stamped).await;
}

/// Best-effort per-client delivery under a read lock: a client whose outbox
/// is full is disconnected and removed (spec.md §4.5, invariant 5 in
/// spec.md §8). The read lock held here forbids removing from the table
/// directly, so a full outbox instead wakes that client's own task via its
/// `disconnect` notify, which tears itself down and removes its own entry.
async fn broadcast_to_others(clients: &HashMap<String, Client>, sender_id: &str, payload: &serde_json::Value) {
    let text = payload.to_string();
    for (id, client) in clients.iter() {
        if id == sender_id {
            continue;
        }
        if client.tx.try_send(Message::Text(text.clone())).is_err() {
            warn!("[{id}] send queue full, disconnecting");
            client.disconnect.notify_one();
        }
    }
}
