//! Opus codec wrapper for voice encoding/decoding
//!
//! Provides a simple i16-PCM interface to the Opus codec: one encoder per
//! session for the microphone, one decoder per channel for received frames.
//! The wire and mixer are 16-bit PCM end to end, so the i16 codec API is
//! used throughout.

use opus::{Application, Channels, Decoder, Encoder};
use thiserror::Error;

use chorus_common::voice::{CAPTURE_FRAME_SAMPLES, DECODER_MAX_SAMPLES, SAMPLE_RATE};

// =============================================================================
// Constants
// =============================================================================

/// Maximum encoded frame size in bytes.
/// At 64kbps with 40ms frames: 64000 * 0.040 / 8 = 320 bytes typical.
/// We allow generous headroom for VBR peaks.
const MAX_ENCODED_FRAME_SIZE: usize = 1024;

/// Encoder bitrate in bits per second (voice quality, well under MTU)
const ENCODER_BITRATE: i32 = 64_000;

// =============================================================================
// Errors
// =============================================================================

/// Errors from the codec adapter
#[derive(Debug, Error)]
pub enum CodecError {
    /// Opus encoder could not be created or configured
    #[error("failed to initialize encoder: {0}")]
    EncoderInit(#[source] opus::Error),

    /// Opus decoder could not be created
    #[error("failed to initialize decoder: {0}")]
    DecoderInit(#[source] opus::Error),

    /// The capture frame has the wrong number of samples
    #[error("expected {expected} samples per frame, got {got}")]
    BadFrameSize { expected: usize, got: usize },

    /// Encoding failed
    #[error("encode failed: {0}")]
    Encode(#[source] opus::Error),

    /// Decoding failed (malformed or oversized frame)
    #[error("decode failed: {0}")]
    Decode(#[source] opus::Error),

    /// The decoder produced no samples
    #[error("decoder produced an empty frame")]
    EmptyFrame,
}

// =============================================================================
// Voice Encoder
// =============================================================================

/// Opus encoder for the outgoing microphone stream
///
/// Configured for 48 kHz mono VoIP with 40 ms frames. One instance exists
/// per active transmission and is released when the transmission ends.
pub struct VoiceEncoder {
    encoder: Encoder,
}

impl VoiceEncoder {
    /// Create a new voice encoder
    pub fn new() -> Result<Self, CodecError> {
        let mut encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(CodecError::EncoderInit)?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(ENCODER_BITRATE))
            .map_err(CodecError::EncoderInit)?;

        Ok(Self { encoder })
    }

    /// Encode one captured frame
    ///
    /// The input must be exactly [`CAPTURE_FRAME_SAMPLES`] mono samples.
    pub fn encode(&mut self, samples: &[i16]) -> Result<Vec<u8>, CodecError> {
        if samples.len() != CAPTURE_FRAME_SAMPLES {
            return Err(CodecError::BadFrameSize {
                expected: CAPTURE_FRAME_SAMPLES,
                got: samples.len(),
            });
        }

        let mut output = vec![0u8; MAX_ENCODED_FRAME_SIZE];
        let len = self
            .encoder
            .encode(samples, &mut output)
            .map_err(CodecError::Encode)?;

        output.truncate(len);
        Ok(output)
    }
}

// =============================================================================
// Voice Decoder
// =============================================================================

/// Opus decoder for one received channel
///
/// Created when the channel is added and dropped when it is removed, so
/// decoder state stays per stream. Tolerates any encoded frame duration that
/// decodes to at most [`DECODER_MAX_SAMPLES`] samples (20, 40, or 100 ms).
pub struct VoiceDecoder {
    decoder: Decoder,
}

impl VoiceDecoder {
    /// Create a new voice decoder
    pub fn new() -> Result<Self, CodecError> {
        let decoder =
            Decoder::new(SAMPLE_RATE, Channels::Mono).map_err(CodecError::DecoderInit)?;
        Ok(Self { decoder })
    }

    /// Decode one encoded frame to mono PCM
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError> {
        let mut output = vec![0i16; DECODER_MAX_SAMPLES];

        let len = self
            .decoder
            .decode(data, &mut output, false)
            .map_err(CodecError::Decode)?;
        if len == 0 {
            return Err(CodecError::EmptyFrame);
        }

        output.truncate(len);
        Ok(output)
    }
}

// =============================================================================
// Tests
// =============================================================================
