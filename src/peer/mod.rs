//! Peer Module - direkte Peer-Verbindung für den Zwei-Parteien-Anruf
//!
//! Dieses Modul kapselt Offer/Answer- und ICE-Verhandlung hinter
//! Capability-Traits, damit die Session-Logik ohne echte
//! Netzwerkverhandlung testbar bleibt. NAT-Traversal übernimmt
//! vollständig die darunterliegende webrtc-Bibliothek.

mod link;

pub use link::{
    default_ice_servers, PeerError, PeerEvent, PeerFactory, PeerLink, PeerRole, RtcPeerFactory,
};
