//! Outbound WebSocket connection with retry.

use std::time::Duration;

use tabbridge_types::{BridgeError, BridgeResult};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// A connected broker socket.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on a single connection attempt.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// One connection attempt.
pub async fn connect_once(url: &str) -> BridgeResult<WsStream> {
    match tokio::time::timeout(ATTEMPT_TIMEOUT, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(BridgeError::Connection(format!("connect to {url} failed: {e}"))),
        Err(_) => Err(BridgeError::Connection(format!(
            "connect to {url} timed out after {}s",
            ATTEMPT_TIMEOUT.as_secs()
        ))),
    }
}

/// Retry every `interval` until connected or `timeout` has elapsed.
pub async fn connect_until(url: &str, timeout: Duration, interval: Duration) -> BridgeResult<WsStream> {
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = tokio::time::timeout(remaining.max(Duration::from_millis(1)), connect_once(url)).await;
        let err = match attempt {
            Ok(Ok(ws)) => {
                debug!(url, attempts, "Connected");
                return Ok(ws);
            }
            Ok(Err(e)) => e,
            Err(_) => BridgeError::Connection(format!("connect to {url} timed out")),
        };
        if Instant::now() + interval >= deadline {
            return Err(BridgeError::Connection(format!(
                "gave up after {attempts} attempts: {}",
                err.wire_message()
            )));
        }
        debug!(url, attempts, error = %err, "Connect attempt failed, retrying");
        tokio::time::sleep(interval).await;
    }
}
