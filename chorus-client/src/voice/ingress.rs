//! Datagram ingress pipeline
//!
//! A single receiver thread blocks on the shared socket and, per datagram:
//! parse envelope → base64 decode → authenticated decrypt → per-channel
//! Opus decode → non-blocking enqueue. Every failure class is counted and
//! the datagram discarded; arbitrary garbage on the socket can never reach
//! the mixer or crash the loop. Enqueue never blocks — a full queue drops
//! its oldest frame (counted by the queue itself).

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tracing::{debug, error, trace};

use chorus_common::crypto::{SecretKey, open};
use chorus_common::protocol::Envelope;
use chorus_common::voice::MAX_DATAGRAM_SIZE;

use super::channel::ChannelMap;
use super::jitter::PcmFrame;

/// Blocking receive loop; runs on the dedicated receiver thread
///
/// The socket carries a short read timeout so the loop notices teardown.
/// Unrecoverable socket errors clear `running`, transitioning the session
/// to stopped.
pub(crate) fn run_receiver(
    socket: &UdpSocket,
    channels: &ChannelMap,
    key: &SecretKey,
    malformed: &AtomicU64,
    running: &AtomicBool,
    epoch: Instant,
) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    debug!("receiver loop started");

    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, _from)) => {
                let now_ms = epoch.elapsed().as_millis() as u64;
                handle_datagram(&buf[..len], channels, key, malformed, now_ms);
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                // Read timeout: just re-check the running flag
            }
            Err(e) => {
                if running.load(Ordering::Relaxed) {
                    error!(error = %e, "unrecoverable socket error, stopping session");
                    running.store(false, Ordering::Relaxed);
                }
                break;
            }
        }
    }

    debug!("receiver loop ended");
}

/// Classify and process one datagram
fn handle_datagram(
    payload: &[u8],
    channels: &ChannelMap,
    key: &SecretKey,
    malformed: &AtomicU64,
    now_ms: u64,
) {
    let envelope = match Envelope::from_datagram(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            malformed.fetch_add(1, Ordering::Relaxed);
            trace!(error = %e, "discarding malformed datagram");
            return;
        }
    };

    let channel_id = match &envelope {
        Envelope::Audio { channel_id, .. } => channel_id,
        // Control traffic (keep-alives included) is not ours to handle
        Envelope::KeepAlive => return,
        Envelope::Unknown => {
            malformed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    if channel_id.is_empty() {
        malformed.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let Some(channel) = channels.get(channel_id) else {
        trace!(channel = %channel_id, "audio for inactive channel, discarding");
        return;
    };

    let sealed = match envelope.sealed_payload() {
        Some(Ok(sealed)) => sealed,
        Some(Err(e)) => {
            malformed.fetch_add(1, Ordering::Relaxed);
            trace!(channel = %channel.id(), error = %e, "invalid base64, discarding");
            return;
        }
        None => return,
    };

    let plaintext = match open(key, &sealed) {
        Ok(plaintext) => plaintext,
        Err(_) => {
            channel.note_auth_error();
            trace!(channel = %channel.id(), "authentication failed, discarding");
            return;
        }
    };

    let samples = match channel.decode(&plaintext) {
        Ok(samples) => samples,
        Err(e) => {
            channel.note_decode_error();
            trace!(channel = %channel.id(), error = %e, "decode failed, discarding");
            return;
        }
    };

    if channel.push_frame(PcmFrame::new(samples)) {
        trace!(channel = %channel.id(), "jitter queue overflow, dropped oldest frame");
    }
    channel.note_received(now_ms);
}

// =============================================================================
// Tests
// =============================================================================
