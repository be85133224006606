//! `kiosk-cockpit` – remote control surfaces for the kiosk screen
//!
//! Three thin adapters over one shared
//! [`DesiredStateStore`][kiosk_kernel::DesiredStateStore].  None of them
//! keeps state of its own: reads come from the store's last verified power
//! state and every write is a `set_desired` call.
//!
//! | Adapter | Default port | Protocol |
//! |---|---|---|
//! | [`ThingServer`] | base | Web Thing description, `on` property over HTTP and WebSocket |
//! | [`ScreenHttpServer`] | base + 1 | `GET /?on=..` JSON endpoint |
//! | [`McpServer`] | base + 2 | MCP tools over JSON-RPC (`POST /mcp`) |
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kiosk_cockpit::{AdapterPorts, serve_all};
//! # async fn run(store: Arc<kiosk_kernel::DesiredStateStore>) {
//! let token = tokio_util::sync::CancellationToken::new();
//! let ports = AdapterPorts::from_base(8090, "-lobby").expect("ports fit");
//! serve_all(store, ports, token)
//!     .await
//!     .expect("adapter failed to start");
//! # }
//! ```

pub mod http;
pub mod mcp;
pub mod screen;
pub mod thing;

use std::sync::Arc;

use kiosk_kernel::DesiredStateStore;
use kiosk_types::KioskError;
use tokio_util::sync::CancellationToken;

pub use mcp::McpServer;
pub use screen::ScreenHttpServer;
pub use thing::ThingServer;

/// Where each adapter listens, and the name it advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterPorts {
    pub name: String,
    pub thing_port: u16,
    pub http_port: u16,
    pub mcp_port: u16,
}

impl AdapterPorts {
    /// Consecutive ports starting at `base`: thing, http, mcp.  `None` when
    /// the mcp port would not fit in a `u16`.
    pub fn from_base(base: u16, name: impl Into<String>) -> Option<Self> {
        Some(Self {
            name: name.into(),
            thing_port: base,
            http_port: base.checked_add(1)?,
            mcp_port: base.checked_add(2)?,
        })
    }
}

/// Bind and run all three adapters until `token` is cancelled.
///
/// # Errors
///
/// The first bind failure stops the others and is returned.
pub async fn serve_all(
    store: Arc<DesiredStateStore>,
    ports: AdapterPorts,
    token: CancellationToken,
) -> Result<(), KioskError> {
    let thing = ThingServer::new(Arc::clone(&store), ports.name.clone(), ports.thing_port);
    let screen = ScreenHttpServer::new(Arc::clone(&store), ports.http_port);
    let mcp = McpServer::new(store, ports.name, ports.mcp_port);

    tokio::try_join!(
        thing.run(token.clone()),
        screen.run(token.clone()),
        mcp.run(token),
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use kiosk_hal::sim::{CallLog, SimDisplay, SimLauncher};
    use kiosk_kernel::{DesiredStateStore, PowerActuator, ProcessSupervisor};
    use kiosk_middleware::EventBus;
    use serde_json::Value;
    use tower::ServiceExt;

    /// Run one request through `router`; an empty body reads as `Null`.
    pub async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    pub async fn call(router: Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(router, request).await
    }

    /// Store over simulated backends with no settle delay.
    pub fn sim_store() -> (Arc<DesiredStateStore>, SimDisplay, CallLog) {
        let log = CallLog::default();
        let display = SimDisplay::new("HDMI-A-2", log.clone());
        let store = DesiredStateStore::new(
            PowerActuator::new(Box::new(display.clone())).with_settle(Duration::ZERO),
            ProcessSupervisor::new(Box::new(SimLauncher::new(log.clone()))),
            EventBus::default(),
        );
        (Arc::new(store), display, log)
    }
}
