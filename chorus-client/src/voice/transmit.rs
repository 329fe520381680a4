//! Transmit pipeline
//!
//! A dedicated thread pulls 40 ms capture frames, runs the optional
//! enhancement chain, Opus-encodes, seals, wraps, and sends one datagram
//! per frame to the configured destination. Only one transmission is active
//! at a time; the shared `transmitting` flag also tells the keep-alive task
//! to stay quiet while voice traffic is flowing.
//!
//! The frame source is built on this thread via its factory because cpal
//! capture streams are not `Send`.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use chorus_common::crypto::{SecretKey, seal};
use chorus_common::protocol::Envelope;

use super::capture::SourceFactory;
use super::codec::VoiceEncoder;
use super::dsp::CaptureChain;

/// How long to wait when no capture frame is ready (a quarter frame)
const CAPTURE_POLL: Duration = Duration::from_millis(5);

// =============================================================================
// Stats
// =============================================================================

/// Counters shared between the transmit thread and the session
#[derive(Default)]
pub(crate) struct TransmitCounters {
    frames_sent: AtomicU64,
    encode_errors: AtomicU64,
}

impl TransmitCounters {
    pub(crate) fn snapshot(&self) -> TransmitStats {
        TransmitStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of the transmit counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransmitStats {
    /// Frames encoded, sealed, and handed to the socket
    pub frames_sent: u64,
    /// Frames the encoder rejected
    pub encode_errors: u64,
}

// =============================================================================
// Transmitter
// =============================================================================

/// Handle to the running transmit thread
pub(crate) struct Transmitter {
    handle: Option<JoinHandle<()>>,
}

impl Transmitter {
    /// Spawn the transmit thread
    ///
    /// The encoder is created by the caller so codec failures surface
    /// synchronously from `begin_transmit`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        socket: Arc<UdpSocket>,
        dest: SocketAddr,
        key: SecretKey,
        channel_id: String,
        encoder: VoiceEncoder,
        source_factory: SourceFactory,
        chain: CaptureChain,
        running: Arc<AtomicBool>,
        transmitting: Arc<AtomicBool>,
        counters: Arc<TransmitCounters>,
    ) -> std::io::Result<Self> {
        let handle = std::thread::Builder::new()
            .name("chorus-transmit".to_string())
            .spawn(move || {
                run_transmit_loop(
                    &socket,
                    dest,
                    &key,
                    &channel_id,
                    encoder,
                    source_factory,
                    chain,
                    &running,
                    &transmitting,
                    &counters,
                );
            })?;

        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Wait for the thread to finish its current frame and exit
    pub(crate) fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_transmit_loop(
    socket: &UdpSocket,
    dest: SocketAddr,
    key: &SecretKey,
    channel_id: &str,
    mut encoder: VoiceEncoder,
    source_factory: SourceFactory,
    mut chain: CaptureChain,
    running: &AtomicBool,
    transmitting: &AtomicBool,
    counters: &TransmitCounters,
) {
    let mut source = match source_factory() {
        Ok(source) => source,
        Err(e) => {
            error!(error = %e, "capture unavailable, transmission aborted");
            transmitting.store(false, Ordering::Relaxed);
            return;
        }
    };

    debug!(channel = %channel_id, enhancements = !chain.is_passthrough(), "transmit loop started");

    while running.load(Ordering::Relaxed) && transmitting.load(Ordering::Relaxed) {
        let Some(mut frame) = source.next_frame() else {
            std::thread::sleep(CAPTURE_POLL);
            continue;
        };

        chain.process(&mut frame);

        let encoded = match encoder.encode(&frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                counters.encode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "encode failed, frame dropped");
                continue;
            }
        };

        let sealed = match seal(key, &encoded) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!(error = %e, "seal failed, frame dropped");
                continue;
            }
        };

        let datagram = match Envelope::audio(channel_id, &sealed).to_datagram() {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(error = %e, "envelope pack failed, frame dropped");
                continue;
            }
        };

        match socket.send_to(&datagram, dest) {
            Ok(_) => {
                counters.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => trace!(error = %e, "voice send failed"),
        }
    }

    debug!(
        frames = counters.frames_sent.load(Ordering::Relaxed),
        "transmit loop ended"
    );
    // The encoder drops with this frame, releasing it per end_transmit
}

// =============================================================================
// Tests
// =============================================================================
