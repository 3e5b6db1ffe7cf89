//! Signaling Module - WebSocket-Kanal zum Relay-/Agent-Server
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Server:
//! - Verbindung mit explizitem Lebenszyklus aufbauen und schließen
//! - Ausgehende Kommandos serialisieren und senden (fire-and-forget)
//! - Eingehende Nachrichten parsen und typisiert weiterleiten
//!

mod channel;
mod messages;

pub use channel::{ChannelSink, CommandSink, SignalingChannel, SignalingError};
pub use messages::*;
