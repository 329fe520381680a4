//! Per-channel runtime state and the concurrent channel map
//!
//! Each active channel owns its jitter queue, its decoder, and a handful of
//! atomic scalars shared between the receiver thread (writes) and the mixer
//! thread (reads). Volume is stored as f32 bits in an `AtomicU32` so
//! concurrent slider updates can never tear a read; pan is a single byte.
//! Everything else the mixer needs (accumulation buffer, gate, fade state)
//! is mixer-private and lives in its lanes, not here.

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use chorus_common::voice::Pan;

use super::codec::{CodecError, VoiceDecoder};
use super::jitter::{JitterQueue, PcmFrame};

// =============================================================================
// Channel State
// =============================================================================

/// Runtime state for one inbound channel
pub struct ChannelState {
    /// Stream identifier
    id: String,
    /// Playback volume in [0.0, 1.0], stored as f32 bits
    volume_bits: AtomicU32,
    /// Stereo routing, stored via `Pan::to_byte`
    pan: AtomicU8,
    /// Decoded frames awaiting the mixer
    queue: JitterQueue,
    /// Per-channel decoder; only the receiver thread locks it
    decoder: Mutex<VoiceDecoder>,
    /// Frames decoded and enqueued
    packets_received: AtomicU64,
    /// Datagrams rejected by GCM authentication
    auth_errors: AtomicU64,
    /// Payloads the decoder rejected
    decode_errors: AtomicU64,
    /// Mixer cycles this channel ran dry after its gate opened
    underflows: AtomicU64,
    /// Milliseconds since session start of the last accepted frame
    last_activity_ms: AtomicU64,
}

impl ChannelState {
    /// Create channel state with a fresh decoder
    ///
    /// Fails only if the decoder cannot be initialized, in which case the
    /// channel must not be added.
    pub fn new(id: &str, volume: f32, pan: Pan) -> Result<Self, CodecError> {
        let decoder = VoiceDecoder::new()?;
        Ok(Self {
            id: id.to_string(),
            volume_bits: AtomicU32::new(volume.clamp(0.0, 1.0).to_bits()),
            pan: AtomicU8::new(pan.to_byte()),
            queue: JitterQueue::new(),
            decoder: Mutex::new(decoder),
            packets_received: AtomicU64::new(0),
            auth_errors: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            underflows: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
        })
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current playback volume
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    /// Set playback volume, clamped to [0.0, 1.0]; takes effect by the next
    /// mixer cycle
    pub fn set_volume(&self, volume: f32) {
        self.volume_bits
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Current stereo routing
    pub fn pan(&self) -> Pan {
        Pan::from_byte(self.pan.load(Ordering::Relaxed))
    }

    /// Set stereo routing; takes effect by the next mixer cycle
    pub fn set_pan(&self, pan: Pan) {
        self.pan.store(pan.to_byte(), Ordering::Relaxed);
    }

    /// Decode a payload on this channel's decoder (receiver thread only)
    pub(crate) fn decode(&self, payload: &[u8]) -> Result<Vec<i16>, CodecError> {
        let mut decoder = match self.decoder.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        decoder.decode(payload)
    }

    /// Enqueue a decoded frame; returns `true` if the queue overflowed and
    /// dropped its oldest frame
    pub fn push_frame(&self, frame: PcmFrame) -> bool {
        self.queue.push(frame)
    }

    /// Dequeue the oldest frame (mixer thread only)
    pub(crate) fn pop_frame(&self) -> Option<PcmFrame> {
        self.queue.pop()
    }

    /// Frames currently queued
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn note_received(&self, now_ms: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
    }

    pub(crate) fn note_auth_error(&self) {
        self.auth_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_underflow(&self) {
        self.underflows.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the channel's counters
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.queue.overflow_count(),
            auth_errors: self.auth_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            underflows: self.underflows.load(Ordering::Relaxed),
            queue_len: self.queue.len(),
            last_activity_ms: self.last_activity_ms.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Channel Stats
// =============================================================================

/// A point-in-time snapshot of one channel's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    /// Frames decoded and enqueued
    pub packets_received: u64,
    /// Frames discarded to jitter queue overflow
    pub packets_dropped: u64,
    /// Datagrams rejected by authentication
    pub auth_errors: u64,
    /// Payloads the decoder rejected
    pub decode_errors: u64,
    /// Mixer underflows after the gate opened
    pub underflows: u64,
    /// Frames currently queued
    pub queue_len: usize,
    /// Milliseconds since session start of the last accepted frame
    pub last_activity_ms: u64,
}

// =============================================================================
// Channel Map
// =============================================================================

/// The set of active channels
///
/// Mutated only by control operations (`add`/`remove`), read by the receiver
/// on every packet and by the mixer on every cycle, so it must support
/// concurrent reads with occasional writes. Cloning is cheap (shared map).
#[derive(Clone, Default)]
pub struct ChannelMap {
    inner: Arc<DashMap<String, Arc<ChannelState>>>,
}

impl ChannelMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Insert a channel; returns `false` if the id already exists
    pub fn insert(&self, state: Arc<ChannelState>) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.inner.entry(state.id().to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(state);
                true
            }
        }
    }

    /// Remove a channel, dropping its queue and decoder
    pub fn remove(&self, id: &str) -> Option<Arc<ChannelState>> {
        self.inner.remove(id).map(|(_, state)| state)
    }

    /// Look up a channel by id
    pub fn get(&self, id: &str) -> Option<Arc<ChannelState>> {
        self.inner.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot the current channel set
    ///
    /// The mixer takes one snapshot per cycle; channels added mid-cycle
    /// begin contributing the next cycle.
    pub fn snapshot(&self) -> Vec<Arc<ChannelState>> {
        self.inner
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of active channels
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True if no channels are active
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Remove every channel (session teardown)
    pub fn clear(&self) {
        self.inner.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: &str) -> Arc<ChannelState> {
        Arc::new(ChannelState::new(id, 1.0, Pan::Center).unwrap())
    }

    #[test]
    fn test_volume_clamped_on_set() {
        let channel = state("a");
        channel.set_volume(2.5);
        assert_eq!(channel.volume(), 1.0);
        channel.set_volume(-0.5);
        assert_eq!(channel.volume(), 0.0);
        channel.set_volume(0.25);
        assert_eq!(channel.volume(), 0.25);
    }

    #[test]
    fn test_volume_clamped_on_create() {
        let channel = ChannelState::new("a", 7.0, Pan::Center).unwrap();
        assert_eq!(channel.volume(), 1.0);
    }

    #[test]
    fn test_pan_updates() {
        let channel = state("a");
        assert_eq!(channel.pan(), Pan::Center);
        channel.set_pan(Pan::Left);
        assert_eq!(channel.pan(), Pan::Left);
        channel.set_pan(Pan::Right);
        assert_eq!(channel.pan(), Pan::Right);
    }

    #[test]
    fn test_stats_reflect_counters() {
        let channel = state("a");
        channel.note_received(120);
        channel.note_received(340);
        channel.note_auth_error();
        channel.note_decode_error();
        channel.note_underflow();
        channel.push_frame(PcmFrame::new(vec![0; 1920]));

        let stats = channel.stats();
        assert_eq!(stats.packets_received, 2);
        assert_eq!(stats.auth_errors, 1);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.underflows, 1);
        assert_eq!(stats.queue_len, 1);
        assert_eq!(stats.last_activity_ms, 340);
        assert_eq!(stats.packets_dropped, 0);
    }

    #[test]
    fn test_map_insert_remove() {
        let map = ChannelMap::new();
        assert!(map.is_empty());

        assert!(map.insert(state("alpha")));
        assert!(map.insert(state("beta")));
        assert_eq!(map.len(), 2);

        // Duplicate ids are refused
        assert!(!map.insert(state("alpha")));
        assert_eq!(map.len(), 2);

        assert!(map.remove("alpha").is_some());
        assert!(map.remove("alpha").is_none());
        assert_eq!(map.len(), 1);
        assert!(map.get("beta").is_some());
        assert!(map.get("alpha").is_none());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let map = ChannelMap::new();
        map.insert(state("alpha"));

        let snapshot = map.snapshot();
        map.remove("alpha");

        // The snapshot keeps its references even after removal
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), "alpha");
        assert!(map.is_empty());
    }

    #[test]
    fn test_clear_drops_everything() {
        let map = ChannelMap::new();
        map.insert(state("a"));
        map.insert(state("b"));
        map.clear();
        assert!(map.is_empty());
    }
}
