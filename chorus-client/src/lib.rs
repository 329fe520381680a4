//! Chorus Client Engine
//!
//! Real-time many-to-one voice streaming client: receives multiple
//! independent encrypted mono Opus streams over UDP, decodes and mixes them
//! into a single stereo output device at low, bounded latency, and transmits
//! one microphone stream back using the same framing.
//!
//! ## Receive path
//! ```text
//! UDP recv_from()
//!     -> JSON envelope parse + base64 decode
//!     -> AES-256-GCM open
//!     -> per-channel Opus decode
//!     -> per-channel jitter queue (bounded, lock-free, drop-oldest)
//!     -> mixer: accumulate -> gain/pan -> sum -> peak limit -> i16 stereo
//!     -> output sink (blocking write paces the mixer at playback rate)
//! ```
//!
//! ## Transmit path
//! ```text
//! microphone capture (48kHz mono, 40ms frames)
//!     -> noise gate / AGC (optional)
//!     -> Opus encode
//!     -> AES-256-GCM seal
//!     -> JSON envelope -> UDP send_to()
//! ```

pub mod config;
pub mod voice;

pub use chorus_common::voice::Pan;
pub use config::SessionConfig;
pub use voice::capture::{AudioCapture, CaptureError, FrameSource, SourceFactory};
pub use voice::channel::ChannelStats;
pub use voice::session::{Session, SessionError};
pub use voice::sink::{AudioSink, BufferSink, BufferSinkHandle, CpalSink, SinkError, SinkFactory};
pub use voice::transmit::TransmitStats;
