//! Message Types für das Signaling-Protokoll
//!
//! Der Relay-Server spricht zwei Dialekte über dieselbe Verbindung:
//! Agent-Nachrichten tragen einen `type`-Diskriminator, Peer-Nachrichten
//! (Zwei-Parteien-Anruf) einen `event`-Diskriminator. Beide werden hier
//! typsicher abgebildet.

use serde::{Deserialize, Serialize};

// ============================================================================
// SIGNAL PAYLOAD
// ============================================================================

/// Opakes Signaling-Blob (SDP Offer/Answer inkl. ICE-Kandidaten)
///
/// Der Inhalt wird unverändert zwischen Relay und PeerLink durchgereicht,
/// der Controller interpretiert ihn nie selbst.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(pub serde_json::Value);

impl SignalPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }
}

// ============================================================================
// CLIENT → SERVER COMMANDS
// ============================================================================

/// Session beim Agent-Server anmelden
#[derive(Debug, Clone, Serialize)]
pub struct InitSessionPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub session_id: String,
    pub user_id: String,
}

impl InitSessionPayload {
    pub fn new(session_id: String, user_id: String) -> Self {
        Self {
            msg_type: "init_session",
            session_id,
            user_id,
        }
    }
}

/// Konversation starten (nach `session_initialized`)
#[derive(Debug, Clone, Serialize)]
pub struct StartConversationPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub session_id: String,
    pub user_id: String,
}

impl StartConversationPayload {
    pub fn new(session_id: String, user_id: String) -> Self {
        Self {
            msg_type: "start_conversation",
            session_id,
            user_id,
        }
    }
}

/// Einen aufgenommenen Audio-Chunk übertragen (Base64-kodiert)
#[derive(Debug, Clone, Serialize)]
pub struct AudioDataPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub session_id: String,
    pub user_id: String,
    pub audio: String,
}

impl AudioDataPayload {
    pub fn new(session_id: String, user_id: String, audio: String) -> Self {
        Self {
            msg_type: "audio_data",
            session_id,
            user_id,
            audio,
        }
    }
}

/// Session beenden (der Server bestätigt mit `session_ended`)
#[derive(Debug, Clone, Serialize)]
pub struct EndSessionPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub session_id: String,
    pub user_id: String,
}

impl EndSessionPayload {
    pub fn new(session_id: String, user_id: String) -> Self {
        Self {
            msg_type: "end_session",
            session_id,
            user_id,
        }
    }
}

/// Anruf-Offer an einen Peer schicken (Peer-Modus)
#[derive(Debug, Clone, Serialize)]
pub struct StartInterviewPayload {
    pub event: &'static str,
    #[serde(rename = "signalData")]
    pub signal_data: SignalPayload,
    pub to: String,
}

impl StartInterviewPayload {
    pub fn new(signal_data: SignalPayload, to: String) -> Self {
        Self {
            event: "startInterview",
            signal_data,
            to,
        }
    }
}

/// Alle ausgehenden Kommandos
///
/// Untagged, da jede Payload ihren Diskriminator bereits selbst trägt.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ClientCommand {
    InitSession(InitSessionPayload),
    StartConversation(StartConversationPayload),
    AudioData(AudioDataPayload),
    EndSession(EndSessionPayload),
    StartInterview(StartInterviewPayload),
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Agent-Nachrichten (`type`-Diskriminator)
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Session wurde serverseitig angelegt
    SessionInitialized { session_id: String },

    /// Transkript der laufenden Konversation (rein informativ)
    Transcript { text: String },

    /// Antwort-Audio des Agenten, Base64-kodiert
    AiAudio {
        audio: String,
        #[serde(default)]
        is_greeting: bool,
    },

    /// Session wurde serverseitig beendet
    SessionEnded { session_id: String },

    /// Fehler vom Server
    Error { message: String },
}

/// Peer-Nachrichten (`event`-Diskriminator)
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event")]
pub enum PeerMessage {
    /// Eingehender Anruf mit Offer
    #[serde(rename = "callUser")]
    CallUser { from: String, signal: SignalPayload },

    /// Gegenstelle hat den Anruf angenommen
    #[serde(rename = "callAccepted")]
    CallAccepted { signal: SignalPayload },

    /// Gegenstelle hat den Anruf beendet
    #[serde(rename = "callEnded")]
    CallEnded,
}

/// Alle möglichen Server-Nachrichten
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Agent(AgentMessage),
    Peer(PeerMessage),
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_session_wire_format() {
        let cmd = ClientCommand::InitSession(InitSessionPayload::new(
            "abc123".to_string(),
            "alice".to_string(),
        ));

        let json: serde_json::Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "init_session");
        assert_eq!(json["session_id"], "abc123");
        assert_eq!(json["user_id"], "alice");
    }

    #[test]
    fn test_audio_data_wire_format() {
        let cmd = ClientCommand::AudioData(AudioDataPayload::new(
            "abc123".to_string(),
            "alice".to_string(),
            "UklGRg==".to_string(),
        ));

        let json: serde_json::Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "audio_data");
        assert_eq!(json["audio"], "UklGRg==");
    }

    #[test]
    fn test_start_interview_wire_format() {
        let signal = SignalPayload::new(serde_json::json!({ "sdp": "v=0" }));
        let cmd = ClientCommand::StartInterview(StartInterviewPayload::new(
            signal,
            "peer-42".to_string(),
        ));

        let json: serde_json::Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["event"], "startInterview");
        assert_eq!(json["signalData"]["sdp"], "v=0");
        assert_eq!(json["to"], "peer-42");
    }

    #[test]
    fn test_parse_session_initialized() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"session_initialized","session_id":"abc123"}"#)
                .unwrap();

        match msg {
            ServerMessage::Agent(AgentMessage::SessionInitialized { session_id }) => {
                assert_eq!(session_id, "abc123");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ai_audio_defaults_greeting() {
        // is_greeting darf fehlen und fällt dann auf false zurück
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"ai_audio","audio":"UklGRg=="}"#).unwrap();

        match msg {
            ServerMessage::Agent(AgentMessage::AiAudio { audio, is_greeting }) => {
                assert_eq!(audio, "UklGRg==");
                assert!(!is_greeting);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_call_user() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"event":"callUser","from":"peer-7","signal":{"sdp":"v=0"}}"#,
        )
        .unwrap();

        match msg {
            ServerMessage::Peer(PeerMessage::CallUser { from, signal }) => {
                assert_eq!(from, "peer-7");
                assert_eq!(signal.0["sdp"], "v=0");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_call_ended_without_payload() {
        let msg: ServerMessage = serde_json::from_str(r#"{"event":"callEnded"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::Peer(PeerMessage::CallEnded)));
    }

    #[test]
    fn test_parse_error_message() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"error","message":"agent unavailable"}"#).unwrap();

        match msg {
            ServerMessage::Agent(AgentMessage::Error { message }) => {
                assert_eq!(message, "agent unavailable");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
