//! Output sink: the single stereo playback device
//!
//! The sink accepts blocking writes of interleaved 16-bit stereo frames.
//! [`CpalSink`] feeds a cpal output stream through a lock-free ring buffer
//! sized for ~320 ms; once the ring is full, `write` waits for the device to
//! drain it. That wait is the mixer's clock — the mixer runs at exactly
//! hardware playback rate without any timer.
//!
//! cpal streams are not `Send`, so the session hands the mixer thread a
//! [`SinkFactory`] and the sink is constructed on that thread.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use thiserror::Error;
use tracing::{debug, trace};

use chorus_common::voice::{OUTPUT_FRAME_SHORTS, SAMPLE_RATE};

// =============================================================================
// Constants
// =============================================================================

/// Stereo output channel count
const STEREO: u16 = 2;

/// Ring capacity in interleaved samples: 8 output frames ≈ 320 ms headroom
const SINK_RING_SHORTS: usize = OUTPUT_FRAME_SHORTS * 8;

/// How long a full-ring write waits before retrying
const WRITE_POLL: Duration = Duration::from_millis(2);

/// Output sample formats in order of preference
const SUPPORTED_FORMATS: [SampleFormat; 2] = [SampleFormat::F32, SampleFormat::I16];

// =============================================================================
// Errors
// =============================================================================

/// Errors from the output sink
#[derive(Debug, Error)]
pub enum SinkError {
    /// No output device is available
    #[error("no output device available")]
    NoDevice,

    /// The device cannot do 48 kHz stereo in a supported format
    #[error("output device has no supported 48kHz stereo configuration")]
    NoSupportedConfig,

    /// The cpal stream failed to build, start, or keep running
    #[error("output stream error: {0}")]
    Stream(String),
}

// =============================================================================
// Audio Sink
// =============================================================================

/// A blocking stereo PCM output
///
/// `write` must accept exactly one interleaved stereo frame and may block
/// until the device has room; the mixer relies on that back-pressure for
/// pacing. A short write is reported, logged by the caller, and not fatal.
pub trait AudioSink {
    /// Write interleaved i16 stereo samples, blocking until accepted.
    /// Returns the number of samples accepted.
    fn write(&mut self, frame: &[i16]) -> Result<usize, SinkError>;
}

/// Constructs the sink on the thread that will own it
pub type SinkFactory = Box<dyn FnOnce() -> Result<Box<dyn AudioSink>, SinkError> + Send>;

// =============================================================================
// Cpal Sink
// =============================================================================

/// Output sink backed by a cpal device stream
pub struct CpalSink {
    _stream: Stream,
    producer: HeapProd<i16>,
    error_rx: std_mpsc::Receiver<String>,
}

impl CpalSink {
    /// Open the system default output device
    pub fn open_default() -> Result<Self, SinkError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(SinkError::NoDevice)?;
        Self::open(&device)
    }

    /// Open a specific output device at 48 kHz stereo
    pub fn open(device: &Device) -> Result<Self, SinkError> {
        let sample_format = find_output_format(device)?;

        let config = StreamConfig {
            channels: STEREO,
            sample_rate: SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        let rb = HeapRb::<i16>::new(SINK_RING_SHORTS);
        let (producer, consumer) = rb.split();

        let (error_tx, error_rx) = std_mpsc::channel();

        let stream = match sample_format {
            SampleFormat::F32 => build_stream_f32(device, &config, consumer, error_tx.clone()),
            SampleFormat::I16 => build_stream_i16(device, &config, consumer, error_tx.clone()),
            _ => return Err(SinkError::NoSupportedConfig),
        }?;

        stream
            .play()
            .map_err(|e| SinkError::Stream(e.to_string()))?;

        debug!(
            format = ?sample_format,
            ring_samples = SINK_RING_SHORTS,
            "output sink opened (48kHz stereo)"
        );

        Ok(Self {
            _stream: stream,
            producer,
            error_rx,
        })
    }
}

impl AudioSink for CpalSink {
    fn write(&mut self, frame: &[i16]) -> Result<usize, SinkError> {
        let mut written = 0;
        while written < frame.len() {
            written += self.producer.push_slice(&frame[written..]);
            if written < frame.len() {
                if let Ok(err) = self.error_rx.try_recv() {
                    return Err(SinkError::Stream(err));
                }
                // The device drains the ring at playback rate; waiting here
                // is what paces the mixer.
                std::thread::sleep(WRITE_POLL);
            }
        }
        Ok(written)
    }
}

/// Pick a supported output format for 48 kHz stereo
fn find_output_format(device: &Device) -> Result<SampleFormat, SinkError> {
    let configs: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| SinkError::Stream(e.to_string()))?
        .collect();

    for format in &SUPPORTED_FORMATS {
        if configs.iter().any(|c| {
            c.channels() >= STEREO
                && c.min_sample_rate().0 <= SAMPLE_RATE
                && c.max_sample_rate().0 >= SAMPLE_RATE
                && c.sample_format() == *format
        }) {
            return Ok(*format);
        }
    }

    Err(SinkError::NoSupportedConfig)
}

fn build_stream_f32(
    device: &Device,
    config: &StreamConfig,
    mut consumer: HeapCons<i16>,
    error_tx: std_mpsc::Sender<String>,
) -> Result<Stream, SinkError> {
    let mut scratch: Vec<i16> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _| {
                scratch.resize(data.len(), 0);
                let read = consumer.pop_slice(&mut scratch);
                if read < data.len() {
                    trace!(missing = data.len() - read, "output underrun");
                    scratch[read..].fill(0);
                }
                for (out, sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = *sample as f32 / 32768.0;
                }
            },
            move |err| {
                let _ = error_tx.send(err.to_string());
            },
            None,
        )
        .map_err(|e| SinkError::Stream(e.to_string()))
}

fn build_stream_i16(
    device: &Device,
    config: &StreamConfig,
    mut consumer: HeapCons<i16>,
    error_tx: std_mpsc::Sender<String>,
) -> Result<Stream, SinkError> {
    device
        .build_output_stream(
            config,
            move |data: &mut [i16], _| {
                let read = consumer.pop_slice(data);
                if read < data.len() {
                    trace!(missing = data.len() - read, "output underrun");
                    data[read..].fill(0);
                }
            },
            move |err| {
                let _ = error_tx.send(err.to_string());
            },
            None,
        )
        .map_err(|e| SinkError::Stream(e.to_string()))
}

// =============================================================================
// Buffer Sink
// =============================================================================

/// A sink that collects written frames in memory
///
/// Used by tests and offline rendering; writes never block, so a mixer
/// driving a `BufferSink` free-runs instead of pacing at playback rate.
#[derive(Default)]
pub struct BufferSink {
    frames: Arc<Mutex<Vec<Vec<i16>>>>,
}

/// Read side of a [`BufferSink`], valid after the sink moved into the mixer
#[derive(Clone)]
pub struct BufferSinkHandle {
    frames: Arc<Mutex<Vec<Vec<i16>>>>,
}

impl BufferSink {
    /// Create an empty buffer sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for inspecting written frames
    pub fn handle(&self) -> BufferSinkHandle {
        BufferSinkHandle {
            frames: Arc::clone(&self.frames),
        }
    }
}

impl AudioSink for BufferSink {
    fn write(&mut self, frame: &[i16]) -> Result<usize, SinkError> {
        let mut frames = match self.frames.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        frames.push(frame.to_vec());
        Ok(frame.len())
    }
}

impl BufferSinkHandle {
    /// Number of frames written so far
    pub fn frame_count(&self) -> usize {
        match self.frames.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Copy of every frame written so far
    pub fn frames(&self) -> Vec<Vec<i16>> {
        match self.frames.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
