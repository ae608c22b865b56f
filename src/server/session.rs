//! One WebSocket session: paired reader/writer tasks for a device.
//!
//! The reader enforces the frame size cap (set at upgrade) and a 60 s
//! read deadline refreshed by any inbound frame; decoded envelopes go
//! to the sync coordinator. The writer drains the hub's send queue
//! with a 10 s per-frame deadline and emits a protocol ping every
//! 30 s. Either side failing tears the session down and unregisters
//! it from the hub.

use crate::auth::AuthGate;
use crate::protocol::{ClientEnvelope, ServerEnvelope};
use crate::server::coordinator::Inbound;
use crate::server::hub::ConnectionHub;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Read deadline, refreshed by any inbound frame.
const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Per-frame write deadline.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Liveness ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Drive a session until either pump stops, then unregister.
pub async fn run_session(
    socket: WebSocket,
    device_id: String,
    hub: Arc<ConnectionHub>,
    inbound: Arc<dyn Inbound>,
    auth: Arc<AuthGate>,
) {
    let (generation, queue) = hub.register(&device_id);
    let (sink, stream) = socket.split();

    let writer = tokio::spawn(write_pump(sink, queue, device_id.clone()));

    read_pump(stream, &device_id, inbound, auth).await;

    hub.unregister(&device_id, generation);
    writer.abort();
    tracing::debug!(device = %device_id, "session ended");
}

async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    device_id: &str,
    inbound: Arc<dyn Inbound>,
    auth: Arc<AuthGate>,
) {
    loop {
        let msg = match timeout(READ_DEADLINE, stream.next()).await {
            Err(_) => {
                tracing::warn!(device = %device_id, "read deadline expired");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                tracing::debug!(device = %device_id, "transport error: {e}");
                return;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                let env: ClientEnvelope = match serde_json::from_str(text.as_str()) {
                    Ok(env) => env,
                    Err(e) => {
                        tracing::warn!(device = %device_id, "invalid frame dropped: {e}");
                        continue;
                    }
                };
                auth.touch_last_seen(device_id);
                inbound.handle(device_id, env).await;
            }
            Message::Close(_) => return,
            // Pongs and pings already refreshed the read deadline.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<ServerEnvelope>,
    device_id: String,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    // The first tick fires immediately; an early ping is harmless.

    loop {
        tokio::select! {
            frame = queue.recv() => {
                let Some(env) = frame else {
                    // Queue closed: this session was displaced or the
                    // hub dropped it. Drain is complete, close politely.
                    let _ = timeout(WRITE_DEADLINE, sink.send(Message::Close(None))).await;
                    return;
                };

                let json = match serde_json::to_string(&env) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::warn!(device = %device_id, "frame serialization failed: {e}");
                        continue;
                    }
                };

                match timeout(WRITE_DEADLINE, sink.send(Message::Text(json.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(device = %device_id, "write failed: {e}");
                        return;
                    }
                    Err(_) => {
                        tracing::warn!(device = %device_id, "write deadline expired");
                        return;
                    }
                }
            }

            _ = ping.tick() => {
                if timeout(WRITE_DEADLINE, sink.send(Message::Ping(Default::default())))
                    .await
                    .map(|r| r.is_err())
                    .unwrap_or(true)
                {
                    tracing::debug!(device = %device_id, "ping failed, closing session");
                    return;
                }
            }
        }
    }
}
