//! Capture Source - lokale Geräte-Akquise
//!
//! `CaptureSource` abstrahiert den Geräte-Zugriff, damit die
//! Session-Logik mit Fakes testbar bleibt. Die cpal-Implementierung
//! nimmt Mono-Audio auf und puffert es als 16-bit PCM; ein
//! Video-Pipeline gibt es in diesem Kern nicht.

use super::{MediaError, SAMPLE_RATE};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Buffer-Größe für den Capture-Ring (muss volle Chunk-Intervalle halten)
const CAPTURE_BUFFER_SECS: usize = 30;

// ============================================================================
// STREAM HANDLE
// ============================================================================

/// Gewünschte Capture-Art des lokalen Geräts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    Video,
    Audio,
}

/// Opakes Handle auf einen laufenden lokalen oder entfernten Stream
///
/// Der Produzent (CaptureSource bzw. PeerLink) besitzt das Gerät, der
/// Konsument liest nur. Das Handle endet mit der Freigabe des Geräts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandle {
    pub id: Uuid,
    pub mode: CaptureMode,
}

impl StreamHandle {
    pub fn new(mode: CaptureMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
        }
    }
}

// ============================================================================
// CAPTURE SOURCE TRAIT
// ============================================================================

/// Lokale Kamera-/Mikrofon-Akquise hinter einem Capability-Trait
pub trait CaptureSource: Send {
    /// Akquiriert das Gerät im gewünschten Modus
    ///
    /// Ein Moduswechsel gibt das alte Gerät erst frei und akquiriert dann
    /// neu; der Session-Status bleibt davon unberührt.
    fn acquire(&mut self, mode: CaptureMode) -> Result<StreamHandle, MediaError>;

    /// Gibt das Gerät frei; idempotent
    fn release(&mut self);

    /// Prüft ob das Gerät akquiriert und aufnahmebereit ist
    fn is_ready(&self) -> bool;

    /// Handle auf den aktuell laufenden Stream (falls akquiriert)
    fn stream(&self) -> Option<StreamHandle>;

    /// Entnimmt das seit dem letzten Aufruf gepufferte Audio (16-bit PCM LE)
    fn drain(&mut self) -> Vec<u8>;

    /// Setzt den Mute-Status
    fn set_muted(&self, muted: bool);

    /// Gibt den Mute-Status zurück
    fn is_muted(&self) -> bool;

    /// Aktueller Eingangspegel (0.0 - 1.0) für Visualisierung
    fn input_level(&self) -> f32;
}

// ============================================================================
// CPAL CAPTURE SOURCE
// ============================================================================

/// Mikrofon-Capture über cpal
///
/// Note: Stream ist nicht Send, daher wrappen wir in Send-fähige Container
pub struct CpalCaptureSource {
    input_device: Option<Device>,
    input_stream: Option<Stream>,
    handle: Option<StreamHandle>,

    /// Ring-Buffer für aufgenommenes Audio (Raw PCM)
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Mute-Status
    is_muted: Arc<Mutex<bool>>,

    /// Audio Level (0.0 - 1.0) für Visualisierung
    input_level: Arc<Mutex<f32>>,
}

// CpalCaptureSource ist nicht automatisch Send wegen Stream
unsafe impl Send for CpalCaptureSource {}

impl CpalCaptureSource {
    /// Erstellt eine neue Capture Source (Gerät noch nicht akquiriert)
    pub fn new() -> Self {
        let host = cpal::default_host();
        let input_device = host.default_input_device();

        if input_device.is_none() {
            tracing::warn!("No audio input device found");
        }

        let buffer_size = SAMPLE_RATE as usize * CAPTURE_BUFFER_SECS;

        Self {
            input_device,
            input_stream: None,
            handle: None,
            capture_buffer: Arc::new(Mutex::new(HeapRb::new(buffer_size))),
            is_muted: Arc::new(Mutex::new(false)),
            input_level: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Findet die beste Input-Konfiguration
    fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| MediaError::UnsupportedConfig(e.to_string()))?;

        Self::select_best_config(configs.collect())
    }

    /// Wählt die beste Konfiguration aus einer Liste
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, MediaError> {
        // Priorität: 48kHz > andere, F32 > andere
        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        for config in &configs {
            if config.min_sample_rate() <= target_rate
                && config.max_sample_rate() >= target_rate
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target_rate).into());
            }
        }

        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                return Ok(config.with_max_sample_rate().into());
            }
        }

        if let Some(config) = configs.first() {
            return Ok(config.with_max_sample_rate().into());
        }

        Err(MediaError::UnsupportedConfig(
            "No suitable audio configuration found".to_string(),
        ))
    }
}

impl Default for CpalCaptureSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for CpalCaptureSource {
    fn acquire(&mut self, mode: CaptureMode) -> Result<StreamHandle, MediaError> {
        if mode == CaptureMode::Video {
            // Kein Kamera-Pfad in diesem Kern; ein kamerafähiger
            // CaptureSource kann den Trait separat implementieren
            return Err(MediaError::UnsupportedMode(mode));
        }

        // Moduswechsel: erst freigeben, dann neu akquirieren
        self.release();

        let device = self
            .input_device
            .as_ref()
            .ok_or(MediaError::NoInputDevice)?;

        let config = Self::find_best_input_config(device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::clone(&self.capture_buffer);
        let is_muted = Arc::clone(&self.is_muted);
        let input_level = Arc::clone(&self.input_level);
        let target_sample_rate = SAMPLE_RATE;
        let source_sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let muted = *is_muted.lock();

                    // Audio Level berechnen (RMS)
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *input_level.lock() = rms.min(1.0);

                    if muted {
                        return;
                    }

                    // Auf Mono reduzieren falls das Gerät mehrkanalig liefert
                    let mono: Vec<f32> = if channels > 1 {
                        data.chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                            .collect()
                    } else {
                        data.to_vec()
                    };

                    // Resampling falls nötig (zu 48kHz, einfaches Linear-Resampling)
                    let samples: Vec<f32> = if source_sample_rate != target_sample_rate {
                        let ratio = target_sample_rate as f32 / source_sample_rate as f32;
                        let new_len = (mono.len() as f32 * ratio) as usize;
                        (0..new_len)
                            .map(|i| {
                                let src_idx = i as f32 / ratio;
                                let idx = src_idx as usize;
                                let frac = src_idx - idx as f32;
                                let s1 = mono.get(idx).copied().unwrap_or(0.0);
                                let s2 = mono.get(idx + 1).copied().unwrap_or(s1);
                                s1 + (s2 - s1) * frac
                            })
                            .collect()
                    } else {
                        mono
                    };

                    // In Ring-Buffer schreiben
                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::StreamPlayError(e.to_string()))?;

        self.input_stream = Some(stream);
        let handle = StreamHandle::new(CaptureMode::Audio);
        self.handle = Some(handle);

        Ok(handle)
    }

    fn release(&mut self) {
        if self.input_stream.take().is_some() {
            tracing::info!("Audio capture released");
        }
        self.handle = None;
        self.capture_buffer.lock().clear();
    }

    fn is_ready(&self) -> bool {
        self.input_stream.is_some()
    }

    fn stream(&self) -> Option<StreamHandle> {
        self.handle
    }

    fn drain(&mut self) -> Vec<u8> {
        let mut buffer = self.capture_buffer.lock();
        let mut pcm = Vec::with_capacity(buffer.occupied_len() * 2);

        while let Some(sample) = buffer.try_pop() {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            pcm.extend_from_slice(&value.to_le_bytes());
        }

        pcm
    }

    fn set_muted(&self, muted: bool) {
        *self.is_muted.lock() = muted;
        tracing::debug!("Audio muted: {}", muted);
    }

    fn is_muted(&self) -> bool {
        *self.is_muted.lock()
    }

    fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_handles_are_unique() {
        let a = StreamHandle::new(CaptureMode::Audio);
        let b = StreamHandle::new(CaptureMode::Audio);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_select_best_config_empty_list() {
        let result = CpalCaptureSource::select_best_config(Vec::new());
        assert!(matches!(result, Err(MediaError::UnsupportedConfig(_))));
    }

    #[test]
    fn test_video_mode_rejected() {
        let mut source = CpalCaptureSource::new();
        let result = source.acquire(CaptureMode::Video);
        assert!(matches!(
            result,
            Err(MediaError::UnsupportedMode(CaptureMode::Video))
        ));
        assert!(!source.is_ready());
    }

    #[test]
    fn test_release_without_acquire_is_noop() {
        let mut source = CpalCaptureSource::new();
        source.release();
        source.release();
        assert!(!source.is_ready());
        assert!(source.stream().is_none());
    }
}
