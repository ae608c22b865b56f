//! WebSocket connection to the sync server, with automatic reconnect.
//!
//! The connection task owns the socket: it pumps outbound frames from
//! the coordinator, feeds inbound frames back into it, and sends a
//! protocol ping every 30 s. On loss it reconnects with exponential
//! back-off, `min(2^n · 1 s, 30 s)`, for up to 10 attempts; an
//! explicit `disconnect()` suppresses reconnection. Every successful
//! (re)connect starts with a full-sync request so an offline gap heals
//! immediately.

use crate::client::coordinator::{ClientCoordinator, Notice};
use crate::protocol::{ClientEnvelope, ServerEnvelope};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Liveness ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Reconnect ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Attempts before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Build the connection URL for a device token (or master token with
/// an explicit device id).
pub fn ws_url(scheme: &str, host: &str, port: u16, token: &str, device_id: &str) -> String {
    format!("{scheme}://{host}:{port}/ws?token={token}&device_id={device_id}")
}

/// Back-off before reconnect attempt `n` (1-based).
fn backoff_delay(attempt: u32) -> Duration {
    let exp = Duration::from_secs(1u64 << (attempt - 1).min(6));
    exp.min(MAX_BACKOFF)
}

/// Lets the host tear the connection down from another task.
#[derive(Clone)]
pub struct ConnectionHandle {
    closed: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ConnectionHandle {
    /// Stop the connection and suppress any further reconnects.
    pub fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Owns the socket lifecycle for one device.
pub struct ClientConnection {
    url: String,
    coordinator: Arc<ClientCoordinator>,
    outbound: mpsc::Receiver<ClientEnvelope>,
    closed: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ClientConnection {
    pub fn new(
        url: impl Into<String>,
        coordinator: Arc<ClientCoordinator>,
        outbound: mpsc::Receiver<ClientEnvelope>,
    ) -> (Self, ConnectionHandle) {
        let closed = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let handle = ConnectionHandle {
            closed: Arc::clone(&closed),
            notify: Arc::clone(&notify),
        };
        (
            Self {
                url: url.into(),
                coordinator,
                outbound,
                closed,
                notify,
            },
            handle,
        )
    }

    /// Run until explicitly disconnected or reconnect attempts are
    /// exhausted.
    pub async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            match tokio_tungstenite::connect_async(&self.url).await {
                Ok((stream, _response)) => {
                    attempt = 0;
                    tracing::info!("connected to sync server");
                    self.coordinator.notify(Notice::Connected);
                    self.coordinator.request_full_sync().await;

                    self.drive(stream).await;

                    tracing::info!("disconnected from sync server");
                    self.coordinator.notify(Notice::Disconnected);
                }
                Err(e) => {
                    tracing::warn!("connect failed: {e}");
                }
            }

            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            attempt += 1;
            if attempt > MAX_RECONNECT_ATTEMPTS {
                tracing::warn!("reconnect attempts exhausted");
                self.coordinator.notify(Notice::SyncFailed {
                    message: "reconnect attempts exhausted".into(),
                });
                return;
            }

            let delay = backoff_delay(attempt);
            self.coordinator.notify(Notice::Reconnecting {
                delay_secs: delay.as_secs(),
            });

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.notify.notified() => return,
            }
        }
    }

    /// Pump one live socket until it drops.
    async fn drive(
        &mut self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (mut sink, mut source) = stream.split();
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                frame = self.outbound.recv() => {
                    let Some(env) = frame else {
                        // Coordinator dropped: nothing left to send.
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return;
                    };
                    let json = match serde_json::to_string(&env) {
                        Ok(j) => j,
                        Err(e) => {
                            tracing::warn!("frame serialization failed: {e}");
                            continue;
                        }
                    };
                    if sink.send(WsMessage::Text(json.into())).await.is_err() {
                        return;
                    }
                }

                inbound = source.next() => {
                    match inbound {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<ServerEnvelope>(text.as_str()) {
                                Ok(env) => self.coordinator.apply(env).await,
                                Err(e) => tracing::warn!("invalid server frame: {e}"),
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            let _ = sink.send(WsMessage::Pong(data)).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => return,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!("transport error: {e}");
                            return;
                        }
                    }
                }

                _ = ping.tick() => {
                    let env = self.coordinator.ping_envelope();
                    let Ok(json) = serde_json::to_string(&env) else { continue };
                    if sink.send(WsMessage::Text(json.into())).await.is_err() {
                        return;
                    }
                }

                () = self.notify.notified() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return;
                }
            }
        }
    }
}
