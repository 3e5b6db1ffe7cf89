//! Session Module - Zustandsmaschine für Anrufe und Agent-Sessions
//!
//! Dieses Modul enthält den Kern des Clients:
//! - `CallSessionController`: die Zustandsmaschine für beide Betriebsarten
//! - Session-, Status- und Turn-Typen
//! - Generierung der clientseitigen Session-IDs

mod controller;

use crate::media::StreamHandle;
use crate::signaling::SignalPayload;
use rand::Rng;
use serde::Serialize;

pub use controller::{CallSessionController, SessionError};

// ============================================================================
// SESSION TYPES
// ============================================================================

/// Status eines Anrufs bzw. einer Agent-Session
///
/// `Ended` ist terminal und löst einen vollständigen Client-Reset aus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Idle,
    Calling,
    Connected,
    Ended,
}

/// Turn-Taking-Zustand der Audio-Disziplin
///
/// Invariante: `Capturing` und `Playing` schließen sich zu jedem
/// Zeitpunkt gegenseitig aus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Idle,
    Capturing,
    AwaitingResponse,
    Playing,
}

/// Eine laufende Session
///
/// Wird beim Start eines Anrufs angelegt und bei explizitem Ende oder
/// serverseitiger Terminierung zerstört. Der Status wird ausschließlich
/// vom `CallSessionController` mutiert.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub status: CallStatus,
}

/// Ein anstehender eingehender Anruf (Peer-Modus)
///
/// Wird bei jedem eingehenden Offer komplett ersetzt und bei
/// Annahme/Ablehnung geleert.
#[derive(Debug, Clone)]
pub struct CallDetails {
    pub identifier: String,
    pub signal: Option<SignalPayload>,
}

// ============================================================================
// OBSERVER EVENTS
// ============================================================================

/// Events für die Präsentationsschicht
///
/// Der Kern rendert nichts selbst; wer auch immer zuhört, bekommt den
/// beobachtbaren Zustand über diesen Strom.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusChanged(CallStatus),
    TurnChanged(TurnState),
    IncomingCall(CallDetails),
    Transcript(String),
    LocalStream(StreamHandle),
    RemoteStream(StreamHandle),
    Error(String),
    /// Terminaler Reset: der Client soll sich vollständig neu aufsetzen
    Reset,
}

// ============================================================================
// SESSION ID
// ============================================================================

const SESSION_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SESSION_ID_LEN: usize = 8;

/// Generiert eine kurze zufällige Base-36 Session-ID
///
/// Nicht global eindeutig; das Kollisionsrisiko ist eine bekannte und
/// akzeptierte Einschränkung.
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_ID_LEN)
        .map(|_| SESSION_ID_ALPHABET[rng.gen_range(0..SESSION_ID_ALPHABET.len())] as char)
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
