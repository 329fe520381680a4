//! Voice constants shared by sender and receiver
//!
//! Everything here is fixed by the wire contract: both ends run at 48 kHz
//! mono with the mixer producing fixed 40 ms frames. Encoded frames may be
//! 20, 40, or 100 ms; the receive side tolerates anything up to
//! [`DECODER_MAX_SAMPLES`] per decoded frame.

use serde::{Deserialize, Serialize};

/// Sample rate for all capture, decode, and playback (required by Opus)
pub const SAMPLE_RATE: u32 = 48_000;

/// Mono samples produced per channel per mixer cycle (40 ms at 48 kHz)
pub const MIXER_FRAME_SAMPLES: usize = 1920;

/// Interleaved stereo samples written to the output sink per mixer cycle
pub const OUTPUT_FRAME_SHORTS: usize = MIXER_FRAME_SAMPLES * 2;

/// Largest decoded frame a single datagram may carry (100 ms at 48 kHz).
///
/// The decoder's output size, not the sender's configured frame duration,
/// governs mixer accumulation.
pub const DECODER_MAX_SAMPLES: usize = 4800;

/// Queued frames required before a channel's gate opens and it first mixes
pub const JITTER_GATE_FRAMES: usize = 5;

/// Length of the linear fade applied around gaps (~1.3 ms at 48 kHz)
pub const FADE_SAMPLES: usize = 64;

/// Capacity of each channel's jitter queue; overflow drops the oldest frame
pub const MAX_QUEUE_FRAMES: usize = 20;

/// Mono samples per captured microphone frame (40 ms, matches the encoder)
pub const CAPTURE_FRAME_SAMPLES: usize = MIXER_FRAME_SAMPLES;

/// Interval between keep-alive datagrams while no transmission is active
pub const KEEPALIVE_INTERVAL_MS: u64 = 10_000;

/// Largest datagram either side will produce or accept
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// Stereo routing of a mono channel at the output device
///
/// `Center` duplicates the mono signal into both sides; `Left`/`Right` mute
/// the opposite side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Pan {
    /// Route to the left output only
    Left,
    /// Route to both outputs
    #[default]
    Center,
    /// Route to the right output only
    Right,
}

impl Pan {
    /// Convert to a byte value (for atomic storage)
    pub fn to_byte(self) -> u8 {
        match self {
            Pan::Left => 0,
            Pan::Center => 1,
            Pan::Right => 2,
        }
    }

    /// Convert from a byte value; unknown values fall back to `Center`
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Pan::Left,
            2 => Pan::Right,
            _ => Pan::Center,
        }
    }
}
