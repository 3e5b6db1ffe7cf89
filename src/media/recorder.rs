//! Chunked Recorder - zeitgesteuertes Chunking des Capture-Streams
//!
//! Solange der Recorder aktiv ist, entnimmt er der Capture Source in
//! festem Takt das gepufferte Audio und übergibt es als Base64-kodiertes
//! `audio_data`-Kommando an den Signaling-Kanal. Chunk-Grenzen sind rein
//! zeitbasiert, es gibt keine Sprachaktivitätserkennung.
//!
//! `start()` und `stop()` sind idempotent: der Controller darf die
//! Stop/Rearm-Sequenz um jede Wiedergabe herum fahren, ohne an jeder
//! Stelle den Recorder-Zustand prüfen zu müssen.

use super::CaptureSource;
use crate::signaling::{AudioDataPayload, ClientCommand, CommandSink};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Referenz-Takt für Chunk-Grenzen
pub const DEFAULT_CHUNK_INTERVAL: Duration = Duration::from_secs(15);

// ============================================================================
// AUDIO CHUNK
// ============================================================================

/// Ein zeitgeschnittenes Segment des Capture-Streams
///
/// Transient: existiert nur zwischen Capture-Entnahme und Übertragung.
/// Die Sequenzposition ergibt sich aus der Ankunftsreihenfolge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub data: Vec<u8>,
}

// ============================================================================
// RECORDER TRAIT
// ============================================================================

/// Start/Stop-Steuerung der Chunk-Aufnahme
pub trait Recorder: Send {
    /// Startet die Aufnahme für die angegebene Session
    ///
    /// No-op mit Warnung, wenn das Gerät nicht bereit oder die Aufnahme
    /// bereits aktiv ist.
    fn start(&mut self, session_id: &str, user_id: &str);

    /// Stoppt die Aufnahme; No-op wenn nicht aktiv
    fn stop(&mut self);

    /// Prüft ob die Aufnahme läuft
    fn is_active(&self) -> bool;
}

// ============================================================================
// CHUNKED RECORDER
// ============================================================================

/// Recorder, der den Capture-Stream in festem Takt in Chunks schneidet
pub struct ChunkedRecorder {
    source: Arc<Mutex<dyn CaptureSource>>,
    sink: Arc<dyn CommandSink>,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl ChunkedRecorder {
    pub fn new(
        source: Arc<Mutex<dyn CaptureSource>>,
        sink: Arc<dyn CommandSink>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            sink,
            interval,
            task: None,
        }
    }
}

impl Recorder for ChunkedRecorder {
    fn start(&mut self, session_id: &str, user_id: &str) {
        if self.task.is_some() {
            tracing::warn!("Recorder already active, ignoring start");
            return;
        }

        if !self.source.lock().is_ready() {
            tracing::warn!("Capture source not ready, ignoring start");
            return;
        }

        // Altes Audio verwerfen: der erste Chunk enthält nur Material,
        // das nach diesem Start aufgenommen wurde
        let _ = self.source.lock().drain();

        let source = Arc::clone(&self.source);
        let sink = Arc::clone(&self.sink);
        let interval = self.interval;
        let session_id = session_id.to_string();
        let user_id = user_id.to_string();

        tracing::info!("Recorder started (chunk interval: {:?})", interval);

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;

                let chunk = AudioChunk {
                    data: source.lock().drain(),
                };
                if chunk.data.is_empty() {
                    continue;
                }

                tracing::debug!("Emitting audio chunk ({} bytes)", chunk.data.len());

                sink.send(ClientCommand::AudioData(AudioDataPayload::new(
                    session_id.clone(),
                    user_id.clone(),
                    BASE64.encode(&chunk.data),
                )));
            }
        }));
    }

    fn stop(&mut self) {
        match self.task.take() {
            Some(task) => {
                task.abort();
                tracing::info!("Recorder stopped");
            }
            None => {
                tracing::debug!("Recorder not active, ignoring stop");
            }
        }
    }

    fn is_active(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for ChunkedRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// TESTS
// ============================================================================
