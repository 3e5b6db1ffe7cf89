//! WebSocket-Kanal zum Relay-/Agent-Server
//!
//! Eine einzelne, persistente Verbindung mit explizitem Lebenszyklus:
//! - `open()` baut die Verbindung auf und liefert den Event-Receiver
//! - `close()` beendet sie wieder
//! - Senden ist fire-and-forget; ein fehlgeschlagener Send wird geloggt,
//!   nie wiederholt
//!
//! Reconnection ist bewusst keine Aufgabe dieses Moduls: nach einem
//! unerwarteten Verbindungsabriss liefert der Kanal schlicht keine
//! Events mehr, bis der Aufrufer einen neuen Kanal öffnet.

use super::messages::{ClientCommand, ServerMessage};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Channel already open")]
    AlreadyOpen,
}

// ============================================================================
// COMMAND SINK
// ============================================================================

/// Abnehmer für ausgehende Kommandos
///
/// Objekt-sicher, damit Controller und Recorder gegen Fakes testbar
/// bleiben. `send` ist bewusst infallibel: ein verlorenes Kommando ist
/// stiller Verlust, kein Fehler des Aufrufers.
pub trait CommandSink: Send + Sync {
    fn send(&self, cmd: ClientCommand);
}

/// Sink auf die Write-Hälfte eines offenen Kanals
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Message>,
}

impl CommandSink for ChannelSink {
    fn send(&self, cmd: ClientCommand) {
        let text = match serde_json::to_string(&cmd) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to serialize command: {}", e);
                return;
            }
        };

        // try_send ist non-blocking; eine volle Queue heißt Verlust
        if let Err(e) = self.tx.try_send(Message::Text(text)) {
            tracing::warn!("Dropped outbound command: {}", e);
        }
    }
}

// ============================================================================
// CHANNEL STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ChannelState {
    is_connected: bool,
}

// ============================================================================
// SIGNALING CHANNEL
// ============================================================================

/// Persistente Verbindung zum Relay-/Agent-Server
pub struct SignalingChannel {
    server_url: String,
    keepalive_interval: Duration,
    state: Arc<RwLock<ChannelState>>,
    tx: Option<mpsc::Sender<Message>>,
}

impl SignalingChannel {
    /// Erstellt einen noch nicht verbundenen Kanal
    pub fn new(server_url: String, keepalive_interval: Duration) -> Self {
        Self {
            server_url,
            keepalive_interval,
            state: Arc::new(RwLock::new(ChannelState::default())),
            tx: None,
        }
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Gibt einen Sink auf den offenen Kanal zurück
    pub fn sink(&self) -> Result<ChannelSink, SignalingError> {
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;
        Ok(ChannelSink { tx: tx.clone() })
    }

    /// Baut die Verbindung auf und liefert den Receiver für eingehende
    /// Server-Nachrichten
    pub async fn open(&mut self) -> Result<mpsc::Receiver<ServerMessage>, SignalingError> {
        if self.tx.is_some() {
            return Err(SignalingError::AlreadyOpen);
        }

        tracing::info!("Connecting to signaling server: {}", self.server_url);

        let (ws_stream, _) = connect_async(&self.server_url)
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<Message>(100);
        let (event_tx, event_rx) = mpsc::channel::<ServerMessage>(100);

        self.tx = Some(tx.clone());
        self.state.write().is_connected = true;

        // Read-Task: eingehende Frames parsen und weiterreichen
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(server_msg) => {
                                if event_tx.send(server_msg).await.is_err() {
                                    // Receiver weg, niemand hört mehr zu
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Unparseable server message: {}", e);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state.write().is_connected = false;
        });

        // Write-Task: Kommando-Queue abarbeiten, am Ende sauber schließen
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        // Keepalive-Task: Pings gegen Idle-Timeouts des Relays
        let ping_tx = tx;
        let ping_state = Arc::clone(&self.state);
        let interval = self.keepalive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !ping_state.read().is_connected {
                    break;
                }
                if ping_tx.try_send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
        });

        Ok(event_rx)
    }

    /// Schließt die Verbindung
    ///
    /// Idempotent; beendet Write- und Keepalive-Task über das Schließen
    /// der Kommando-Queue.
    pub fn close(&mut self) {
        if self.tx.take().is_some() {
            tracing::info!("Closing signaling channel");
        }
        self.state.write().is_connected = false;
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("server_url", &self.server_url)
            .field("is_connected", &self.is_connected())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::messages::InitSessionPayload;

    fn init_session_cmd() -> ClientCommand {
        ClientCommand::InitSession(InitSessionPayload::new(
            "abc123".to_string(),
            "alice".to_string(),
        ))
    }

    #[tokio::test]
    async fn test_sink_serializes_commands() {
        let (tx, mut rx) = mpsc::channel::<Message>(8);
        let sink = ChannelSink { tx };

        sink.send(init_session_cmd());

        match rx.recv().await {
            Some(Message::Text(text)) => {
                let json: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(json["type"], "init_session");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sink_drops_on_full_queue() {
        // Queue mit Kapazität 1: der zweite Send geht verloren, ohne Panic
        let (tx, mut rx) = mpsc::channel::<Message>(1);
        let sink = ChannelSink { tx };

        sink.send(init_session_cmd());
        sink.send(init_session_cmd());

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sink_survives_closed_receiver() {
        let (tx, rx) = mpsc::channel::<Message>(1);
        drop(rx);
        let sink = ChannelSink { tx };

        // Stiller Verlust, kein Fehler
        sink.send(init_session_cmd());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut channel =
            SignalingChannel::new("ws://localhost:8080".to_string(), Duration::from_secs(25));

        channel.close();
        channel.close();
        assert!(!channel.is_connected());
        assert!(channel.sink().is_err());
    }
}
