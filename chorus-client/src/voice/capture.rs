//! Microphone capture
//!
//! Captures 48 kHz mono i16 frames of [`CAPTURE_FRAME_SAMPLES`] for the
//! transmit pipeline. The cpal callback appends converted samples to a
//! shared buffer with bounded growth; the transmit thread pulls whole frames
//! out of it. Stereo-only devices are downmixed by averaging; devices that
//! cannot run at 48 kHz are rejected.
//!
//! cpal streams are not `Send`, so the transmitter constructs its source on
//! its own thread through a [`SourceFactory`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SampleRate, Stream, StreamConfig};
use thiserror::Error;
use tracing::{debug, error};

use chorus_common::voice::{CAPTURE_FRAME_SAMPLES, SAMPLE_RATE};

// =============================================================================
// Constants
// =============================================================================

/// Bound on buffered capture (in frames) if the transmit thread stalls
const MAX_CAPTURE_BUFFER_FRAMES: usize = 10;

/// Input sample formats in order of preference
const SUPPORTED_FORMATS: [SampleFormat; 2] = [SampleFormat::F32, SampleFormat::I16];

// =============================================================================
// Errors
// =============================================================================

/// Errors from microphone capture
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No input device is available
    #[error("no input device available")]
    NoDevice,

    /// The device cannot capture 48 kHz mono or stereo in a supported format
    #[error("input device has no supported 48kHz configuration")]
    NoSupportedConfig,

    /// The cpal stream failed to build or start
    #[error("input stream error: {0}")]
    Stream(String),
}

// =============================================================================
// Frame Source
// =============================================================================

/// Supplies mono capture frames to the transmit loop
pub trait FrameSource {
    /// The next frame of exactly [`CAPTURE_FRAME_SAMPLES`] samples, or
    /// `None` if a full frame has not accumulated yet
    fn next_frame(&mut self) -> Option<Vec<i16>>;
}

/// Constructs the frame source on the thread that will own it
pub type SourceFactory = Box<dyn FnOnce() -> Result<Box<dyn FrameSource>, CaptureError> + Send>;

// =============================================================================
// Audio Capture
// =============================================================================

/// Microphone capture backed by a cpal input stream
pub struct AudioCapture {
    _stream: Stream,
    buffer: Arc<Mutex<Vec<i16>>>,
}

impl AudioCapture {
    /// Open the system default input device
    pub fn open_default() -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;
        Self::open(&device)
    }

    /// Open a specific input device at 48 kHz
    pub fn open(device: &Device) -> Result<Self, CaptureError> {
        let (sample_format, channels) = find_input_config(device)?;

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer = Arc::new(Mutex::new(Vec::with_capacity(CAPTURE_FRAME_SAMPLES * 4)));

        let stream = match sample_format {
            SampleFormat::F32 => {
                build_input_stream::<f32>(device, &config, Arc::clone(&buffer), channels)
            }
            SampleFormat::I16 => {
                build_input_stream::<i16>(device, &config, Arc::clone(&buffer), channels)
            }
            _ => return Err(CaptureError::NoSupportedConfig),
        }?;

        stream
            .play()
            .map_err(|e| CaptureError::Stream(e.to_string()))?;

        debug!(format = ?sample_format, channels, "capture stream opened (48kHz)");

        Ok(Self {
            _stream: stream,
            buffer,
        })
    }
}

impl FrameSource for AudioCapture {
    fn next_frame(&mut self) -> Option<Vec<i16>> {
        let mut buffer = match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if buffer.len() >= CAPTURE_FRAME_SAMPLES {
            Some(buffer.drain(..CAPTURE_FRAME_SAMPLES).collect())
        } else {
            None
        }
    }
}

/// Pick a supported input format and channel count for 48 kHz
///
/// Mono is preferred; stereo is accepted and downmixed.
fn find_input_config(device: &Device) -> Result<(SampleFormat, u16), CaptureError> {
    let configs: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| CaptureError::Stream(e.to_string()))?
        .collect();

    for channels in [1u16, 2] {
        for format in &SUPPORTED_FORMATS {
            if configs.iter().any(|c| {
                c.channels() == channels
                    && c.min_sample_rate().0 <= SAMPLE_RATE
                    && c.max_sample_rate().0 >= SAMPLE_RATE
                    && c.sample_format() == *format
            }) {
                return Ok((*format, channels));
            }
        }
    }

    Err(CaptureError::NoSupportedConfig)
}

fn build_input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    buffer: Arc<Mutex<Vec<i16>>>,
    channels: u16,
) -> Result<Stream, CaptureError>
where
    T: cpal::SizedSample,
    i16: FromSample<T>,
{
    // One error log per stream, not one per callback
    let reported = AtomicBool::new(false);

    device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                let Ok(mut buf) = buffer.lock() else {
                    return;
                };

                if channels == 1 {
                    buf.extend(data.iter().map(|s| i16::from_sample(*s)));
                } else {
                    // Downmix by averaging the interleaved channels
                    buf.extend(data.chunks_exact(channels as usize).map(|chunk| {
                        let sum: i32 = chunk.iter().map(|s| i16::from_sample(*s) as i32).sum();
                        (sum / channels as i32) as i16
                    }));
                }

                let max = CAPTURE_FRAME_SAMPLES * MAX_CAPTURE_BUFFER_FRAMES;
                if buf.len() > max {
                    let excess = buf.len() - max;
                    buf.drain(..excess);
                }
            },
            move |err| {
                if !reported.swap(true, Ordering::Relaxed) {
                    error!(error = %err, "capture stream error");
                }
            },
            None,
        )
        .map_err(|e| CaptureError::Stream(e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================
