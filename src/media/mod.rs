//! Media Module - Geräte-Zugriff und Audio-Verarbeitung
//!
//! Dieses Modul verwaltet:
//! - Mikrofon-Capture hinter dem `CaptureSource`-Trait
//! - Wiedergabe dekodierter Antwort-Audio hinter dem `PlaybackSink`-Trait
//! - Zeitgesteuertes Chunking des Capture-Streams (`ChunkedRecorder`)
//!
//! Der Controller greift nie direkt auf Geräte-Handles zu, nur auf die
//! Lifecycle-Methoden dieser Traits.

mod capture;
mod playback;
mod recorder;

use thiserror::Error;

pub use capture::{CaptureMode, CaptureSource, CpalCaptureSource, StreamHandle};
pub use playback::{CpalPlaybackSink, PlaybackSink};
pub use recorder::{AudioChunk, ChunkedRecorder, Recorder, DEFAULT_CHUNK_INTERVAL};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Capture mode not supported by this source: {0:?}")]
    UnsupportedMode(CaptureMode),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}
