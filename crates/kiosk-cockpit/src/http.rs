//! Connection plumbing shared by the adapters.
//!
//! Each accepted connection carries one request: [`serve_connection`] runs
//! an axum [`Router`] over it through hyper's HTTP/1 server with keep-alive
//! off, then closes.  Limits:
//!
//! | Limit | Value |
//! |---|---|
//! | request head (line and headers) | [`MAX_HEAD`] bytes, else `431` |
//! | request body | [`MAX_BODY`] bytes, else `413` |
//! | time to send the head | [`HEAD_TIMEOUT`] |
//! | whole connection | [`CONNECTION_TIMEOUT`] |

use std::future::Future;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use kiosk_types::KioskError;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MAX_HEAD: usize = 16 * 1024;
pub const MAX_BODY: usize = 64 * 1024;
pub const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Bind a listener on all interfaces.
pub async fn bind(port: u16) -> Result<TcpListener, KioskError> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| KioskError::Io(format!("bind error on port {port}: {e}")))
}

/// Accept connections until `token` is cancelled, running `handler` on a
/// fresh task for each one.  Connection errors are logged and dropped.
pub async fn serve<F, Fut>(
    listener: TcpListener,
    token: CancellationToken,
    adapter: &'static str,
    handler: F,
) where
    F: Fn(TcpStream) -> Fut,
    Fut: Future<Output = Result<(), KioskError>> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(adapter, %addr, "listening");
    }
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let connection = handler(stream);
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            debug!(adapter, %peer, error = %e, "connection closed with error");
                        }
                    });
                }
                Err(e) => warn!(adapter, error = %e, "accept error"),
            }
        }
    }
    info!(adapter, "listener stopped");
}

/// Answer the single request on `io` with `router`.
///
/// # Errors
///
/// Returns [`KioskError::Io`] when the client sends a malformed or
/// oversized head, stalls, or the connection breaks.
pub async fn serve_connection<I>(io: I, router: Router) -> Result<(), KioskError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection = http1::Builder::new()
        .keep_alive(false)
        .max_buf_size(MAX_HEAD)
        .timer(TokioTimer::new())
        .header_read_timeout(HEAD_TIMEOUT)
        .serve_connection(TokioIo::new(io), TowerToHyperService::new(router));

    match tokio::time::timeout(CONNECTION_TIMEOUT, connection).await {
        Ok(result) => result.map_err(|e| KioskError::Io(format!("http connection: {e}"))),
        Err(_) => Err(KioskError::Io(format!(
            "http connection open longer than {CONNECTION_TIMEOUT:?}"
        ))),
    }
}

/// `{"error": message}` with `status`.
pub fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}
