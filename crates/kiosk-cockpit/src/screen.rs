//! [`ScreenHttpServer`] – plain HTTP JSON control of the screen.
//!
//! | Request | Effect | Reply |
//! |---|---|---|
//! | `GET /` | none | `{"screen_on": true\|false\|null}` |
//! | `GET /?on=true` (`1`, `on`) | forced wake | `{"status":"success","screen_on":..}` |
//! | `GET /?on=<anything else>` | sleep | `{"status":"success","screen_on":..}` |
//!
//! A failed transition answers `500 {"error": ".."}`.  The path is ignored.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use kiosk_kernel::DesiredStateStore;
use kiosk_types::{KioskError, PowerState};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::http;

pub struct ScreenHttpServer {
    store: Arc<DesiredStateStore>,
    port: u16,
}

impl ScreenHttpServer {
    pub fn new(store: Arc<DesiredStateStore>, port: u16) -> Self {
        Self { store, port }
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
        let router = router(self.store);
        http::serve(listener, token, "screen-http", move |stream| {
            http::serve_connection(stream, router.clone())
        })
        .await;
    }
}

/// Every path answers; only `GET` is allowed.
pub fn router(store: Arc<DesiredStateStore>) -> Router {
    Router::new()
        .fallback(screen)
        .layer(DefaultBodyLimit::max(http::MAX_BODY))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

async fn screen(
    State(store): State<Arc<DesiredStateStore>>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if method != Method::GET {
        return http::error(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("method {method} not allowed"),
        );
    }

    let Some(value) = query.get("on") else {
        return Json(json!({ "screen_on": screen_on(store.observed_on()) })).into_response();
    };

    let on = parse_on(value);
    // Waking from here always re-issues the power command.
    match store.set_desired(on, on).await {
        Ok(observed) => {
            info!(on, observed = %observed, "screen set over http");
            Json(json!({ "status": "success", "screen_on": screen_on(observed) })).into_response()
        }
        Err(e) => {
            warn!(on, error = %e, "screen change over http failed");
            http::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// `true`, `1` and `on` (any case) mean on; everything else means off.
pub fn parse_on(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "on")
}

fn screen_on(state: PowerState) -> Value {
    state.as_bool().map_or(Value::Null, Value::Bool)
}
