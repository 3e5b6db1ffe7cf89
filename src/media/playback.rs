//! Playback Sink - Wiedergabe dekodierter Antwort-Audio
//!
//! Ein `play`-Aufruf übergibt genau einen dekodierten PCM-Buffer an das
//! Ausgabegerät. Die Übergabe ist synchron; wann das Gerät den Buffer
//! tatsächlich fertig abgespielt hat, meldet der Sink nicht zurück.

use super::{MediaError, SAMPLE_RATE};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;

/// Buffer-Größe für den Playback-Ring
const PLAYBACK_BUFFER_SECS: usize = 60;

// ============================================================================
// PLAYBACK SINK TRAIT
// ============================================================================

/// Abspielen eines dekodierten Audio-Buffers
pub trait PlaybackSink: Send {
    /// Übergibt einen PCM-Buffer (16-bit LE, mono, 48kHz) an das Gerät
    fn play(&mut self, pcm: &[u8]) -> Result<(), MediaError>;
}

// ============================================================================
// CPAL PLAYBACK SINK
// ============================================================================

/// Lautsprecher-Wiedergabe über cpal
///
/// Note: Stream ist nicht Send, daher wrappen wir in Send-fähige Container
pub struct CpalPlaybackSink {
    output_device: Option<Device>,
    output_stream: Option<Stream>,

    /// Ring-Buffer für zu spielendes Audio (decoded PCM)
    playback_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Audio Level (0.0 - 1.0) für Visualisierung
    output_level: Arc<Mutex<f32>>,
}

unsafe impl Send for CpalPlaybackSink {}

impl CpalPlaybackSink {
    /// Erstellt einen neuen Playback Sink (Stream startet beim ersten `play`)
    pub fn new() -> Self {
        let host = cpal::default_host();
        let output_device = host.default_output_device();

        if output_device.is_none() {
            tracing::warn!("No audio output device found");
        }

        let buffer_size = SAMPLE_RATE as usize * PLAYBACK_BUFFER_SECS;

        Self {
            output_device,
            output_stream: None,
            playback_buffer: Arc::new(Mutex::new(HeapRb::new(buffer_size))),
            output_level: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Aktueller Ausgangspegel (0.0 - 1.0)
    pub fn output_level(&self) -> f32 {
        *self.output_level.lock()
    }

    /// Baut den Output-Stream auf und startet ihn
    fn start_stream(&mut self) -> Result<(), MediaError> {
        let device = self
            .output_device
            .as_ref()
            .ok_or(MediaError::NoOutputDevice)?;

        let config = Self::find_output_config(device)?;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let playback_buffer = Arc::clone(&self.playback_buffer);
        let output_level = Arc::clone(&self.output_level);
        let source_sample_rate = SAMPLE_RATE;
        let target_sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut buffer = playback_buffer.lock();
                    let mut level_sum = 0.0f32;
                    let mut sample_count = 0;

                    // Mono zu Stereo (falls nötig) und Resampling
                    let samples_needed = data.len() / channels;
                    let ratio = source_sample_rate as f32 / target_sample_rate as f32;
                    let source_samples_needed = (samples_needed as f32 * ratio) as usize;

                    for i in 0..samples_needed {
                        let src_idx = (i as f32 * ratio) as usize;

                        let sample = if src_idx < source_samples_needed {
                            buffer.try_pop().unwrap_or(0.0)
                        } else {
                            0.0
                        };

                        level_sum += sample.abs();
                        sample_count += 1;

                        // Auf alle Kanäle verteilen
                        for c in 0..channels {
                            if let Some(s) = data.get_mut(i * channels + c) {
                                *s = sample;
                            }
                        }
                    }

                    if sample_count > 0 {
                        *output_level.lock() = (level_sum / sample_count as f32).min(1.0);
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::StreamPlayError(e.to_string()))?;

        self.output_stream = Some(stream);
        Ok(())
    }

    /// Findet eine passende Output-Konfiguration
    fn find_output_config(device: &Device) -> Result<StreamConfig, MediaError> {
        let configs = device
            .supported_output_configs()
            .map_err(|e| MediaError::UnsupportedConfig(e.to_string()))?;

        let target_rate = cpal::SampleRate(SAMPLE_RATE);
        let configs: Vec<_> = configs.collect();

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

impl Default for CpalPlaybackSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackSink for CpalPlaybackSink {
    fn play(&mut self, pcm: &[u8]) -> Result<(), MediaError> {
        if self.output_stream.is_none() {
            self.start_stream()?;
        }

        // 16-bit PCM LE nach f32 wandeln und in den Ring-Buffer schreiben
        let mut buffer = self.playback_buffer.lock();
        for bytes in pcm.chunks_exact(2) {
            let value = i16::from_le_bytes([bytes[0], bytes[1]]);
            let sample = value as f32 / i16::MAX as f32;
            let _ = buffer.try_push(sample);
        }

        tracing::debug!("Queued {} bytes for playback", pcm.len());
        Ok(())
    }
}
