//! Peer Link - WebRTC-Verhandlung hinter einem Capability-Trait
//!
//! Die Verhandlung läuft ohne Trickle-ICE: das lokale Signal wird genau
//! einmal emittiert, nachdem das ICE-Gathering abgeschlossen ist. So
//! genügt pro Richtung ein einziges Signaling-Blob über den Relay.

use crate::media::{CaptureMode, StreamHandle, CHANNELS, SAMPLE_RATE};
use crate::signaling::SignalPayload;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid signal payload: {0}")]
    InvalidSignal(String),
}

// ============================================================================
// EVENTS & ROLES
// ============================================================================

/// Rolle in der Offer/Answer-Verhandlung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Erstellt das Offer (Anrufer)
    Initiator,
    /// Beantwortet ein fremdes Offer (Angerufener)
    Responder,
}

/// Events, die ein PeerLink an den Controller meldet
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Lokales Signal (Offer oder Answer) ist fertig verhandelt
    LocalSignal(SignalPayload),

    /// Entfernter Media-Stream ist eingetroffen
    RemoteStream(StreamHandle),

    /// Verhandlung oder Verbindung fehlgeschlagen
    Failed(String),

    /// Verbindung wurde geschlossen
    Closed,
}

// ============================================================================
// CAPABILITY TRAITS
// ============================================================================

/// Eine direkte Peer-Media-Verbindung
pub trait PeerLink: Send {
    /// Speist ein entferntes Signal (Offer/Answer) ein
    fn signal(&mut self, payload: SignalPayload);

    /// Reißt die Verbindung ab und gibt alle Ressourcen frei; idempotent
    fn destroy(&mut self);

    /// Prüft ob die Verbindung bereits abgerissen wurde
    fn is_destroyed(&self) -> bool;
}

/// Fabrik für PeerLinks, injiziert in den Controller
pub trait PeerFactory: Send + Sync {
    fn create(
        &self,
        role: PeerRole,
        local_stream: Option<StreamHandle>,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Box<dyn PeerLink>, PeerError>;
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

// ============================================================================
// RTC PEER LINK
// ============================================================================

/// PeerLink auf Basis der webrtc-Bibliothek
///
/// Die eigentliche Verhandlung läuft in einem eigenen Task; der Link
/// selbst hält nur die Kanäle dorthin.
struct RtcPeerLink {
    signal_tx: mpsc::Sender<SignalPayload>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl PeerLink for RtcPeerLink {
    fn signal(&mut self, payload: SignalPayload) {
        if let Err(e) = self.signal_tx.try_send(payload) {
            tracing::warn!("Dropped remote signal: {}", e);
        }
    }

    fn destroy(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            tracing::info!("Destroying peer link");
            let _ = tx.send(());
        }
    }

    fn is_destroyed(&self) -> bool {
        self.shutdown_tx.is_none()
    }
}

impl Drop for RtcPeerLink {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Fabrik für webrtc-basierte PeerLinks
pub struct RtcPeerFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }

    /// Setzt optionale TURN-Server Credentials
    pub fn with_turn_server(mut self, url: String, username: String, credential: String) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url],
            username,
            credential,
            ..Default::default()
        });
        self
    }
}

impl Default for RtcPeerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerFactory for RtcPeerFactory {
    fn create(
        &self,
        role: PeerRole,
        _local_stream: Option<StreamHandle>,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Box<dyn PeerLink>, PeerError> {
        let (signal_tx, signal_rx) = mpsc::channel::<SignalPayload>(8);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let ice_servers = self.ice_servers.clone();
        let task_events = events.clone();

        tokio::spawn(async move {
            if let Err(e) =
                run_negotiation(role, ice_servers, signal_rx, shutdown_rx, &task_events).await
            {
                tracing::error!("Peer negotiation failed: {}", e);
                let _ = task_events.send(PeerEvent::Failed(e.to_string())).await;
            }
        });

        Ok(Box::new(RtcPeerLink {
            signal_tx,
            shutdown_tx: Some(shutdown_tx),
        }))
    }
}

// ============================================================================
// NEGOTIATION TASK
// ============================================================================

/// Führt die komplette Offer/Answer-Verhandlung aus und hält die
/// Verbindung bis zum Shutdown-Signal
async fn run_negotiation(
    role: PeerRole,
    ice_servers: Vec<RTCIceServer>,
    mut signal_rx: mpsc::Receiver<SignalPayload>,
    mut shutdown_rx: oneshot::Receiver<()>,
    events: &mpsc::Sender<PeerEvent>,
) -> Result<(), PeerError> {
    let pc = create_peer_connection(ice_servers, events.clone()).await?;

    match role {
        PeerRole::Initiator => {
            // Offer erstellen, Gathering abwarten, lokales Signal melden
            let offer = pc
                .create_offer(None)
                .await
                .map_err(|e| PeerError::WebRTC(e.to_string()))?;

            let mut gather_complete = pc.gathering_complete_promise().await;
            pc.set_local_description(offer)
                .await
                .map_err(|e| PeerError::WebRTC(e.to_string()))?;
            let _ = gather_complete.recv().await;

            if let Some(local) = pc.local_description().await {
                let _ = events
                    .send(PeerEvent::LocalSignal(to_signal_payload(&local)?))
                    .await;
            }

            // Auf das Answer der Gegenstelle warten
            tokio::select! {
                _ = &mut shutdown_rx => {
                    let _ = pc.close().await;
                    return Ok(());
                }
                sig = signal_rx.recv() => {
                    if let Some(sig) = sig {
                        let answer = to_session_description(&sig, false)?;
                        pc.set_remote_description(answer)
                            .await
                            .map_err(|e| PeerError::WebRTC(e.to_string()))?;
                    }
                }
            }
        }

        PeerRole::Responder => {
            // Zuerst das fremde Offer abwarten
            let offer = tokio::select! {
                _ = &mut shutdown_rx => {
                    let _ = pc.close().await;
                    return Ok(());
                }
                sig = signal_rx.recv() => match sig {
                    Some(sig) => to_session_description(&sig, true)?,
                    None => {
                        let _ = pc.close().await;
                        return Ok(());
                    }
                }
            };

            pc.set_remote_description(offer)
                .await
                .map_err(|e| PeerError::WebRTC(e.to_string()))?;

            let answer = pc
                .create_answer(None)
                .await
                .map_err(|e| PeerError::WebRTC(e.to_string()))?;

            let mut gather_complete = pc.gathering_complete_promise().await;
            pc.set_local_description(answer)
                .await
                .map_err(|e| PeerError::WebRTC(e.to_string()))?;
            let _ = gather_complete.recv().await;

            if let Some(local) = pc.local_description().await {
                let _ = events
                    .send(PeerEvent::LocalSignal(to_signal_payload(&local)?))
                    .await;
            }
        }
    }

    // Verbindung halten, bis der Controller den Link abreißt
    let _ = shutdown_rx.await;
    let _ = pc.close().await;
    let _ = events.send(PeerEvent::Closed).await;

    Ok(())
}

/// Erstellt eine neue Peer Connection mit registrierten Event-Handlern
async fn create_peer_connection(
    ice_servers: Vec<RTCIceServer>,
    events: mpsc::Sender<PeerEvent>,
) -> Result<Arc<RTCPeerConnection>, PeerError> {
    // Media Engine mit Standard-Codecs konfigurieren
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| PeerError::WebRTC(e.to_string()))?;

    // Interceptors für RTCP, NACK etc.
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| PeerError::WebRTC(e.to_string()))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    let pc = Arc::new(
        api.new_peer_connection(config)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?,
    );

    // Lokalen Audio Track anlegen
    let audio_track = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: SAMPLE_RATE,
            channels: CHANNELS,
            ..Default::default()
        },
        "audio".to_string(),
        "duplex".to_string(),
    ));

    pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| PeerError::WebRTC(e.to_string()))?;

    // Connection State Handler
    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);

        let event = match s {
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                Some(PeerEvent::Failed(format!("connection state {s}")))
            }
            _ => None,
        };

        let state_events = state_events.clone();
        Box::pin(async move {
            if let Some(event) = event {
                let _ = state_events.send(event).await;
            }
        })
    }));

    // Track Handler (für eingehendes Audio)
    let track_events = events;
    pc.on_track(Box::new(move |track, _, _| {
        let track_events = track_events.clone();
        Box::pin(async move {
            tracing::info!("Received remote track: {:?}", track.codec());
            let _ = track_events
                .send(PeerEvent::RemoteStream(StreamHandle::new(
                    CaptureMode::Audio,
                )))
                .await;
        })
    }));

    Ok(pc)
}

// ============================================================================
// SIGNAL CONVERSION
// ============================================================================

/// Lokale Session Description in ein opakes Signaling-Blob verpacken
fn to_signal_payload(desc: &RTCSessionDescription) -> Result<SignalPayload, PeerError> {
    let value = serde_json::to_value(desc).map_err(|e| PeerError::InvalidSignal(e.to_string()))?;
    Ok(SignalPayload::new(value))
}

/// Entferntes Signaling-Blob in eine Session Description übersetzen
fn to_session_description(
    payload: &SignalPayload,
    expect_offer: bool,
) -> Result<RTCSessionDescription, PeerError> {
    let sdp = payload
        .0
        .get("sdp")
        .and_then(|v| v.as_str())
        .ok_or_else(|| PeerError::InvalidSignal("missing sdp field".to_string()))?
        .to_string();

    let result = if expect_offer {
        RTCSessionDescription::offer(sdp)
    } else {
        RTCSessionDescription::answer(sdp)
    };

    result.map_err(|e| PeerError::InvalidSignal(e.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destroy_is_idempotent() {
        let (signal_tx, _signal_rx) = mpsc::channel(1);
        let (shutdown_tx, _shutdown_rx) = oneshot::channel();
        let mut link = RtcPeerLink {
            signal_tx,
            shutdown_tx: Some(shutdown_tx),
        };

        assert!(!link.is_destroyed());
        link.destroy();
        link.destroy();
        assert!(link.is_destroyed());
    }

    #[test]
    fn test_turn_server_is_appended_to_ice_config() {
        let factory = RtcPeerFactory::new().with_turn_server(
            "turn:turn.example.com:3478".to_string(),
            "user".to_string(),
            "secret".to_string(),
        );

        assert_eq!(factory.ice_servers.len(), 2);
        let turn = factory.ice_servers.last().unwrap();
        assert_eq!(turn.urls, vec!["turn:turn.example.com:3478".to_string()]);
        assert_eq!(turn.username, "user");
    }

    #[test]
    fn test_session_description_requires_sdp() {
        let payload = SignalPayload::new(serde_json::json!({ "type": "answer" }));
        let result = to_session_description(&payload, false);
        assert!(matches!(result, Err(PeerError::InvalidSignal(_))));
    }

    #[test]
    fn test_signal_after_destroy_is_silent() {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let (shutdown_tx, _shutdown_rx) = oneshot::channel();
        let mut link = RtcPeerLink {
            signal_tx,
            shutdown_tx: Some(shutdown_tx),
        };

        link.destroy();
        drop(signal_rx);

        // Stiller Verlust, kein Panic
        link.signal(SignalPayload::new(serde_json::json!({ "sdp": "v=0" })));
    }
}
