//! Duplex - Client-Kern für Anrufe und Voice-Agent-Sessions
//!
//! Ein Client-Kern mit zwei Betriebsarten über einen gemeinsamen
//! Signaling-Kanal:
//! - Peer-Modus: Zwei-Parteien-Anruf, vermittelt über einen Relay
//! - Agent-Modus: Half-Duplex-Konversation mit einem Voice-Agenten,
//!   mit striktem Turn-Taking zwischen Aufnahme und Wiedergabe
//!
//! Der `CallClient` verdrahtet alle Bausteine und treibt den
//! `CallSessionController` über eine einzelne Event-Schleife.

pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

use media::{
    CaptureMode, CaptureSource, ChunkedRecorder, CpalCaptureSource, CpalPlaybackSink,
    DEFAULT_CHUNK_INTERVAL,
};
use parking_lot::Mutex;
use peer::{PeerFactory, RtcPeerFactory};
use session::{CallSessionController, CallStatus, SessionError, SessionEvent, TurnState};
use signaling::{CommandSink, SignalingChannel, SignalingError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Default Signaling URL (kann über Umgebungsvariable überschrieben werden)
const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8080";

/// Keepalive gegen Idle-Timeouts des Relays
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Konfiguration des Clients
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub user_id: String,
    pub capture_mode: CaptureMode,
    pub chunk_interval: Duration,
    pub keepalive_interval: Duration,
}

impl ClientConfig {
    /// Konfiguration mit Defaults; `SIGNALING_URL` aus der Umgebung
    /// gewinnt gegen den eingebauten Default
    pub fn new(user_id: impl Into<String>) -> Self {
        let signaling_url = std::env::var("SIGNALING_URL")
            .unwrap_or_else(|_| DEFAULT_SIGNALING_URL.to_string());

        Self {
            signaling_url,
            user_id: user_id.into(),
            capture_mode: CaptureMode::Audio,
            chunk_interval: DEFAULT_CHUNK_INTERVAL,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("")
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging
///
/// Einmal pro Prozess aufrufen; `RUST_LOG` überschreibt die Defaults.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("duplex=debug".parse().expect("valid directive"))
                .add_directive("webrtc=warn".parse().expect("valid directive")),
        )
        .init();
}

// ============================================================================
// CALL CLIENT
// ============================================================================

/// Die verdrahtete Client-Instanz
///
/// Besitzt den Signaling-Kanal und die Event-Schleife; die eigentliche
/// Zustandslogik lebt im `CallSessionController`. Alle Methoden sind
/// dünne Durchreichungen, die kurz den Controller locken.
pub struct CallClient {
    controller: Arc<Mutex<CallSessionController>>,
    channel: SignalingChannel,
    event_loop: Option<JoinHandle<()>>,
}

impl CallClient {
    /// Verbindet sich mit dem Server und startet die Event-Schleife
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let mut channel =
            SignalingChannel::new(config.signaling_url.clone(), config.keepalive_interval);
        let mut server_rx = channel.open().await?;
        let sink: Arc<dyn CommandSink> = Arc::new(channel.sink()?);

        let capture: Arc<Mutex<dyn CaptureSource>> =
            Arc::new(Mutex::new(CpalCaptureSource::new()));
        let recorder = Box::new(ChunkedRecorder::new(
            Arc::clone(&capture),
            Arc::clone(&sink),
            config.chunk_interval,
        ));
        let playback = Box::new(CpalPlaybackSink::new());
        let peer_factory: Arc<dyn PeerFactory> = Arc::new(RtcPeerFactory::new());

        let (peer_tx, mut peer_rx) = mpsc::channel(32);

        let mut controller = CallSessionController::new(
            config.user_id,
            capture,
            recorder,
            playback,
            sink,
            peer_factory,
            peer_tx,
        );
        controller.set_preferred_capture_mode(config.capture_mode);
        let controller = Arc::new(Mutex::new(controller));

        // Die eine logische Event-Schleife: Server-Nachrichten und
        // Peer-Events laufen seriell durch den Controller, dadurch
        // braucht die Zustandslogik selbst keine Nebenläufigkeit
        let loop_controller = Arc::clone(&controller);
        let event_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = server_rx.recv() => match msg {
                        Some(msg) => loop_controller.lock().handle_message(msg),
                        None => {
                            tracing::info!("Signaling channel closed, stopping event loop");
                            break;
                        }
                    },
                    event = peer_rx.recv() => match event {
                        Some(event) => loop_controller.lock().handle_peer_event(event),
                        None => break,
                    },
                }
            }
        });

        Ok(Self {
            controller,
            channel,
            event_loop: Some(event_loop),
        })
    }

    /// Gibt einen Event-Receiver für die Präsentationsschicht zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.controller.lock().subscribe()
    }

    /// Aktueller Session-Status
    pub fn status(&self) -> CallStatus {
        self.controller.lock().status()
    }

    /// Aktueller Turn-Taking-Zustand
    pub fn turn_state(&self) -> TurnState {
        self.controller.lock().turn_state()
    }

    // ========================================================================
    // MODE A — PEER-TO-PEER CALL
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    pub fn start_call(&self, target_id: &str) -> Result<(), ClientError> {
        Ok(self.controller.lock().start_call(target_id)?)
    }

    /// Nimmt den anstehenden eingehenden Anruf an
    pub fn accept_call(&self) -> Result<(), ClientError> {
        Ok(self.controller.lock().accept_call()?)
    }

    /// Lehnt den anstehenden eingehenden Anruf ab
    pub fn reject_call(&self) {
        self.controller.lock().reject_call();
    }

    /// Beendet den laufenden Anruf
    pub fn leave_call(&self) {
        self.controller.lock().leave_call();
    }

    /// Wechselt die Capture-Art (Video↔Audio)
    pub fn set_capture_mode(&self, mode: CaptureMode) -> Result<(), ClientError> {
        self.controller.lock().set_capture_mode(mode)?;
        Ok(())
    }

    /// Setzt den Mute-Status
    pub fn set_muted(&self, muted: bool) {
        self.controller.lock().set_muted(muted);
    }

    /// Gibt den Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        self.controller.lock().is_muted()
    }

    // ========================================================================
    // MODE B — AGENT SESSION
    // ========================================================================

    /// Startet eine Agent-Session
    pub fn init_session(&self) -> Result<(), ClientError> {
        Ok(self.controller.lock().init_session()?)
    }

    /// Bittet den Server, die laufende Session zu beenden
    pub fn end_conversation(&self) -> Result<(), ClientError> {
        Ok(self.controller.lock().end_conversation()?)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Schließt Verbindung und Event-Schleife
    pub fn close(&mut self) {
        if let Some(task) = self.event_loop.take() {
            task.abort();
        }
        self.channel.close();
    }
}

impl Drop for CallClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CallClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallClient")
            .field("channel", &self.channel)
            .field("status", &self.status())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
