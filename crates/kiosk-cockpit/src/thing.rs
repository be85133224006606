//! [`ThingServer`] – the screen as a Web Thing with a single `on` property.
//!
//! Plain HTTP requests and WebSocket upgrades share one port; the first
//! bytes of each connection are peeked to tell them apart, so the WebSocket
//! handshake still sees the full request.
//!
//! # HTTP
//!
//! | Request | Reply |
//! |---|---|
//! | `GET /` | Thing description |
//! | `GET /properties`, `GET /properties/on` | `{"on": true\|false\|null}` |
//! | `PUT /properties/on` with `{"on": bool}` | `{"on": ..}` after the transition |
//!
//! # WebSocket
//!
//! Outgoing: `propertyStatus` on connect and after every change of the
//! verified power state, and `event` messages for repairs, load restarts
//! and wake requests.  Incoming: `setProperty` with `{"on": bool}`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use kiosk_kernel::DesiredStateStore;
use kiosk_middleware::Topic;
use kiosk_types::{Event, EventPayload, KioskError, PowerState};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::http;

pub const THING_ID: &str = "urn:dev:ops:screen-1";
pub const PROPERTY: &str = "on";

pub struct ThingServer {
    store: Arc<DesiredStateStore>,
    name: String,
    port: u16,
}

impl ThingServer {
    pub fn new(store: Arc<DesiredStateStore>, name: impl Into<String>, port: u16) -> Self {
        Self {
            store,
            name: name.into(),
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind the configured port and serve until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::Io`] if the port cannot be bound.
    pub async fn run(self, token: CancellationToken) -> Result<(), KioskError> {
        let listener = http::bind(self.port).await?;
        self.serve(listener, token).await;
        Ok(())
    }

    pub async fn serve(self, listener: TcpListener, token: CancellationToken) {
        // One store listener per server fans out to every socket.
        let (changes, _) = broadcast::channel::<()>(16);
        let notify = changes.clone();
        self.store.add_listener(Arc::new(move || {
            let _ = notify.send(());
        }));

        let store = self.store;
        let router = router(Arc::clone(&store), self.name);
        let sockets = token.clone();
        http::serve(listener, token, "thing", move |stream| {
            connection(
                Arc::clone(&store),
                router.clone(),
                stream,
                changes.subscribe(),
                sockets.clone(),
            )
        })
        .await;
    }
}

async fn connection(
    store: Arc<DesiredStateStore>,
    router: Router,
    stream: TcpStream,
    changes: broadcast::Receiver<()>,
    token: CancellationToken,
) -> Result<(), KioskError> {
    let peer = stream.peer_addr().map_err(|e| KioskError::Io(e.to_string()))?;

    let mut buf = [0u8; 1024];
    let n = tokio::time::timeout(http::HEAD_TIMEOUT, stream.peek(&mut buf))
        .await
        .map_err(|_| KioskError::Io(format!("no request from {peer}")))?
        .map_err(|e| KioskError::Io(format!("peek error from {peer}: {e}")))?;
    if is_upgrade(&buf[..n]) {
        return websocket(store, stream, peer, changes, token).await;
    }
    http::serve_connection(stream, router).await
}

fn is_upgrade(head: &[u8]) -> bool {
    String::from_utf8_lossy(head).lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    })
}

#[derive(Clone)]
struct ThingState {
    store: Arc<DesiredStateStore>,
    name: Arc<str>,
}

/// Plain HTTP routes.  Unknown paths get `404`, other methods on known
/// paths `405`.
pub fn router(store: Arc<DesiredStateStore>, name: impl Into<Arc<str>>) -> Router {
    Router::new()
        .route("/", get(describe))
        .route("/properties", get(read_property))
        .route("/properties/on", get(read_property).put(write_property))
        .layer(DefaultBodyLimit::max(http::MAX_BODY))
        .layer(TraceLayer::new_for_http())
        .with_state(ThingState {
            store,
            name: name.into(),
        })
}

async fn describe(State(state): State<ThingState>, headers: HeaderMap) -> Json<Value> {
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    Json(description(&state.name, host))
}

async fn read_property(State(state): State<ThingState>) -> Json<Value> {
    Json(json!({ PROPERTY: on_value(state.store.observed_on()) }))
}

async fn write_property(State(state): State<ThingState>, body: Bytes) -> Response {
    let Some(on) = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|body| body.get(PROPERTY).and_then(Value::as_bool))
    else {
        return http::error(StatusCode::BAD_REQUEST, "expected {\"on\": bool}");
    };
    match state.store.set_desired(on, false).await {
        Ok(observed) => {
            info!(on, "screen set over thing property");
            Json(json!({ PROPERTY: on_value(observed) })).into_response()
        }
        Err(e) => {
            warn!(on, error = %e, "screen change over thing property failed");
            http::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Thing description served at `/`.
pub fn description(name: &str, host: Option<&str>) -> Value {
    let mut links = vec![json!({ "rel": "properties", "href": "/properties" })];
    if let Some(host) = host {
        links.push(json!({ "rel": "alternate", "href": format!("ws://{host}") }));
    }
    json!({
        "@context": "https://webthings.io/schemas/",
        "@type": ["MultiLevelSensor"],
        "id": THING_ID,
        "title": format!("screen{name}"),
        "description": "screen",
        "properties": {
            PROPERTY: {
                "title": PROPERTY,
                "type": "boolean",
                "description": "True, if screen is on",
                "readOnly": false,
                "links": [{ "rel": "property", "href": "/properties/on" }],
            }
        },
        "events": {
            "repair": { "description": "Drift from the desired state was corrected" },
            "restart": { "description": "The application was restarted after overload" },
            "wake": { "description": "Touch input woke the screen" },
        },
        "links": links,
    })
}

async fn websocket(
    store: Arc<DesiredStateStore>,
    stream: TcpStream,
    peer: SocketAddr,
    mut changes: broadcast::Receiver<()>,
    token: CancellationToken,
) -> Result<(), KioskError> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| KioskError::Io(format!("websocket handshake from {peer}: {e}")))?;
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut repairs = store.bus().subscribe_to(Topic::Repairs);
    let mut presence = store.bus().subscribe_to(Topic::Presence);
    debug!(%peer, "thing socket open");

    let mut outgoing = Some(property_status(store.observed_on()));
    loop {
        if let Some(message) = outgoing.take() {
            ws_tx
                .send(Message::Text(message.to_string().into()))
                .await
                .map_err(|e| KioskError::Io(format!("websocket send to {peer}: {e}")))?;
        }

        outgoing = tokio::select! {
            _ = token.cancelled() => break,
            change = changes.recv() => match change {
                Ok(()) | Err(RecvError::Lagged(_)) => Some(property_status(store.observed_on())),
                Err(RecvError::Closed) => break,
            },
            event = repairs.recv() => match event {
                Ok(event) => event_message(&event),
                Err(RecvError::Lagged(n)) => {
                    warn!(%peer, skipped = n, "thing socket lagging behind repairs");
                    None
                }
                Err(RecvError::Closed) => break,
            },
            event = presence.recv() => match event {
                Ok(event) => event_message(&event),
                Err(RecvError::Lagged(_)) => None,
                Err(RecvError::Closed) => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => incoming(&store, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    return Err(KioskError::Io(format!("websocket receive from {peer}: {e}")));
                }
                Some(Ok(_)) => None,
            },
        };
    }

    debug!(%peer, "thing socket closed");
    Ok(())
}

/// Apply one client message.  Returns an error message to send back, if
/// any; successful changes are announced by the change listener.
async fn incoming(store: &DesiredStateStore, text: &str) -> Option<Value> {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        return Some(error_message("400 Bad Request", "message is not JSON"));
    };
    match message.get("messageType").and_then(Value::as_str) {
        Some("setProperty") => {}
        Some(other) => {
            return Some(error_message(
                "400 Bad Request",
                &format!("unsupported messageType {other:?}"),
            ));
        }
        None => return Some(error_message("400 Bad Request", "missing messageType")),
    }

    let Some(on) = message
        .get("data")
        .and_then(|data| data.get(PROPERTY))
        .and_then(Value::as_bool)
    else {
        return Some(error_message("400 Bad Request", "expected data.on as bool"));
    };
    match store.set_desired(on, false).await {
        Ok(_) => {
            info!(on, "screen set over thing socket");
            None
        }
        Err(e) => {
            warn!(on, error = %e, "screen change over thing socket failed");
            Some(error_message("500 Internal Server Error", &e.to_string()))
        }
    }
}

pub fn property_status(state: PowerState) -> Value {
    json!({ "messageType": "propertyStatus", "data": { PROPERTY: on_value(state) } })
}

/// Thing `event` message for a bus event, `None` for payloads that are not
/// exposed as thing events.
pub fn event_message(event: &Event) -> Option<Value> {
    let (name, data) = match &event.payload {
        EventPayload::Repair { resource, details } => {
            ("repair", json!({ "resource": resource, "details": details }))
        }
        EventPayload::LoadRestart { cpu_percent } => {
            ("restart", json!({ "cpu_percent": cpu_percent }))
        }
        EventPayload::WakeRequested { device } => ("wake", json!({ "device": device })),
        EventPayload::DisplayObserved { .. } | EventPayload::ProcessObserved { .. } => {
            return None;
        }
    };
    Some(json!({
        "messageType": "event",
        "data": {
            name: { "data": data, "timestamp": event.timestamp.to_rfc3339() }
        }
    }))
}

fn error_message(status: &str, message: &str) -> Value {
    json!({ "messageType": "error", "data": { "status": status, "message": message } })
}

fn on_value(state: PowerState) -> Value {
    state.as_bool().map_or(Value::Null, Value::Bool)
}
