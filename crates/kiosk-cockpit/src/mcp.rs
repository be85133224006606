//! [`McpServer`] – Model Context Protocol tool endpoint.
//!
//! JSON-RPC 2.0 over `POST /mcp`.  Two tools are offered:
//!
//! - `get_screen_power` – reports the last verified power state.
//! - `set_screen_power { on: bool }` – declares the desired state.
//!
//! Tool failures are reported inside the tool result (`isError: true`), not
//! as JSON-RPC errors, so clients can show the message to the model.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use kiosk_kernel::DesiredStateStore;
use kiosk_types::{KioskError, PowerState};
use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::http;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const ENDPOINT: &str = "/mcp";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

/// Arguments of `get_screen_power`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetScreenPowerArgs {}

/// Arguments of `set_screen_power`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SetScreenPowerArgs {
    /// `true` to turn the screen on, `false` to turn it off.
    pub on: bool,
}

pub struct McpServer {
    store: Arc<DesiredStateStore>,
    name: String,
    port: u16,
}

impl McpServer {
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
        let router = router(self.store, self.name);
        http::serve(listener, token, "mcp", move |stream| {
            http::serve_connection(stream, router.clone())
        })
        .await;
    }
}

#[derive(Clone)]
struct McpState {
    store: Arc<DesiredStateStore>,
    name: Arc<str>,
}

/// `POST /mcp` only; other methods get `405`, other paths `404`.
pub fn router(store: Arc<DesiredStateStore>, name: impl Into<Arc<str>>) -> Router {
    Router::new()
        .route(ENDPOINT, post(rpc))
        .layer(DefaultBodyLimit::max(http::MAX_BODY))
        .layer(TraceLayer::new_for_http())
        .with_state(McpState {
            store,
            name: name.into(),
        })
}

/// Unparseable bodies get a JSON-RPC parse error; notifications get an
/// empty `202`.
async fn rpc(State(state): State<McpState>, body: Bytes) -> Response {
    let Ok(message) = serde_json::from_slice::<Value>(&body) else {
        return Json(rpc_error(Value::Null, PARSE_ERROR, "parse error")).into_response();
    };
    match handle_rpc(&state.store, &state.name, &message).await {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// Handle one JSON-RPC message.  Notifications (no `id`) yield `None`.
pub async fn handle_rpc(store: &DesiredStateStore, name: &str, message: &Value) -> Option<Value> {
    let id = message.get("id").cloned();
    let Some(method) = message.get("method").and_then(Value::as_str) else {
        return Some(rpc_error(id.unwrap_or(Value::Null), INVALID_REQUEST, "missing method"));
    };
    let Some(id) = id else {
        debug!(method, "mcp notification");
        return None;
    };
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    let reply = match method {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": name, "version": env!("CARGO_PKG_VERSION") },
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tools() })),
        "tools/call" => call_tool(store, &params).await,
        other => Err((METHOD_NOT_FOUND, format!("method not found: {other}"))),
    };

    Some(match reply {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err((code, message)) => rpc_error(id, code, &message),
    })
}

fn tools() -> Vec<Value> {
    vec![
        json!({
            "name": "get_screen_power",
            "description": "Retrieves the current power status of the screen.",
            "inputSchema": schema_for!(GetScreenPowerArgs),
        }),
        json!({
            "name": "set_screen_power",
            "description": "Controls the power state of the screen.",
            "inputSchema": schema_for!(SetScreenPowerArgs),
        }),
    ]
}

async fn call_tool(store: &DesiredStateStore, params: &Value) -> Result<Value, (i64, String)> {
    let tool = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match tool {
        "get_screen_power" => {
            let text = match store.observed_on() {
                PowerState::Unknown => "The screen state is currently unknown.".to_string(),
                state => format!("The screen is currently {state}."),
            };
            Ok(tool_result(text, false))
        }
        "set_screen_power" => {
            let args: SetScreenPowerArgs = serde_json::from_value(arguments)
                .map_err(|e| (INVALID_PARAMS, format!("invalid arguments: {e}")))?;
            let state = PowerState::from_bool(args.on);
            match store.set_desired(args.on, false).await {
                Ok(_) => {
                    info!(on = args.on, "screen set over mcp");
                    Ok(tool_result(format!("Screen successfully turned {state}."), false))
                }
                Err(e) => {
                    warn!(on = args.on, error = %e, "screen change over mcp failed");
                    Ok(tool_result(
                        format!("Failed to change screen power state: {e}"),
                        true,
                    ))
                }
            }
        }
        other => Err((INVALID_PARAMS, format!("unknown tool: {other:?}"))),
    }
}

fn tool_result(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

fn rpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, sim_store};
    use kiosk_hal::sim::Call;

    fn call(id: u64, method: &str, params: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
    }

    fn text(reply: &Value) -> &str {
        reply["result"]["content"][0]["text"].as_str().unwrap()
    }

    #[tokio::test]
    async fn initialize_reports_server_name() {
        let (store, _, _) = sim_store();
        let reply = handle_rpc(&store, "lobby", &call(1, "initialize", json!({})))
            .await
            .unwrap();
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"]["serverInfo"]["name"], "lobby");
        assert_eq!(reply["result"]["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn notifications_get_no_reply() {
        let (store, _, _) = sim_store();
        let note = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
        assert!(handle_rpc(&store, "lobby", &note).await.is_none());
    }

    #[tokio::test]
    async fn tools_are_listed_with_schemas() {
        let (store, _, _) = sim_store();
        let reply = handle_rpc(&store, "lobby", &call(2, "tools/list", json!({})))
            .await
            .unwrap();
        let tools = reply["result"]["tools"].as_array().unwrap();
        let names: Vec<_> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, ["get_screen_power", "set_screen_power"]);
        assert_eq!(tools[1]["inputSchema"]["properties"]["on"]["type"], "boolean");
        assert_eq!(tools[1]["inputSchema"]["required"], json!(["on"]));
    }

    #[tokio::test]
    async fn set_then_get() {
        let (store, _, log) = sim_store();
        let args = json!({ "name": "set_screen_power", "arguments": { "on": true } });
        let reply = handle_rpc(&store, "lobby", &call(3, "tools/call", args)).await.unwrap();
        assert_eq!(text(&reply), "Screen successfully turned on.");
        assert_eq!(reply["result"]["isError"], false);
        assert_eq!(log.actions(), vec![Call::Launch, Call::PowerCommand(true)]);

        let args = json!({ "name": "get_screen_power" });
        let reply = handle_rpc(&store, "lobby", &call(4, "tools/call", args)).await.unwrap();
        assert_eq!(text(&reply), "The screen is currently on.");
    }

    #[tokio::test]
    async fn get_before_any_probe_is_unknown() {
        let (store, _, _) = sim_store();
        let args = json!({ "name": "get_screen_power", "arguments": {} });
        let reply = handle_rpc(&store, "lobby", &call(5, "tools/call", args)).await.unwrap();
        assert_eq!(text(&reply), "The screen state is currently unknown.");
    }

    #[tokio::test]
    async fn backend_failure_is_a_tool_error() {
        let (store, display, _) = sim_store();
        display.fail_commands(true);
        let args = json!({ "name": "set_screen_power", "arguments": { "on": true } });
        let reply = handle_rpc(&store, "lobby", &call(6, "tools/call", args)).await.unwrap();
        assert!(text(&reply).starts_with("Failed to change screen power state:"));
        assert_eq!(reply["result"]["isError"], true);
    }

    #[tokio::test]
    async fn protocol_errors() {
        let (store, _, _) = sim_store();
        let reply = handle_rpc(&store, "lobby", &call(7, "resources/list", json!({})))
            .await
            .unwrap();
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);

        let args = json!({ "name": "set_screen_power", "arguments": { "on": "maybe" } });
        let reply = handle_rpc(&store, "lobby", &call(8, "tools/call", args)).await.unwrap();
        assert_eq!(reply["error"]["code"], INVALID_PARAMS);

        let (status, body) = testing::call(router(store, "lobby"), "POST", ENDPOINT, "{").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"]["code"], PARSE_ERROR);
    }

    #[tokio::test]
    async fn only_post_to_the_endpoint() {
        let (store, _, _) = sim_store();
        let app = router(store, "lobby");
        let (status, _) = testing::call(app.clone(), "GET", ENDPOINT, "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        let (status, _) = testing::call(app.clone(), "POST", "/", "{}").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let note = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        let (status, body) = testing::call(app.clone(), "POST", ENDPOINT, note).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, Value::Null);

        let ping = call(9, "ping", json!({})).to_string();
        let (status, body) = testing::call(app, "POST", ENDPOINT, &ping).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], 9);
    }
}
