//! The fixed-rate software mixer
//!
//! One dedicated thread drains every channel's jitter queue, sums gained and
//! panned samples into a 32-bit stereo accumulator, limits the peak, and
//! writes exactly [`OUTPUT_FRAME_SHORTS`] 16-bit samples to the sink. The
//! sink's blocking write against a finite device buffer paces the loop at
//! hardware playback rate; there is no timer.
//!
//! Decoded frames arrive at up to 100 ms granularity, which does not divide
//! into 40 ms mixer frames. Cutting a partial frame every few cycles puts
//! mid-frame silence transients on the output and audible crackle with it,
//! so each channel has a mixer-private accumulation lane: frames drain into
//! the lane, every emitted frame takes exactly [`MIXER_FRAME_SAMPLES`], and
//! the residue carries over to the next cycle.
//!
//! The jitter gate is one-shot. A channel must queue `gate_frames` before it
//! first mixes, and from then on the gate never closes: re-gating after
//! brief silence inserted audible 200-300 ms pauses, while an open gate
//! renders underruns as natural silence with a short fade.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use chorus_common::voice::{
    DECODER_MAX_SAMPLES, FADE_SAMPLES, MIXER_FRAME_SAMPLES, OUTPUT_FRAME_SHORTS, Pan,
};

use super::channel::ChannelMap;
use super::sink::AudioSink;

// =============================================================================
// Constants
// =============================================================================

/// How long the mixer sleeps when no channel contributed
const IDLE_BACKOFF: Duration = Duration::from_millis(5);

/// Cycle report cadence
const REPORT_EVERY_CYCLES: u64 = 50;

// =============================================================================
// Lane
// =============================================================================

/// Mixer-private per-channel scratch state
struct Lane {
    /// Samples pending output; `[0, len)` are valid, residue shifts forward
    /// after every emitted frame
    acc: Vec<i16>,
    /// One-shot jitter gate; never returns to false once opened
    gate_open: bool,
    /// Whether the channel emitted a full frame last cycle
    had_data: bool,
    /// Apply a fade-in to the next full frame (set when a gap interrupted
    /// the stream; suppresses the resumption click)
    fade_in_pending: bool,
    /// Last emitted post-gain sample, held for the fade-out
    last_sample: i16,
}

impl Lane {
    fn new() -> Self {
        Self {
            acc: Vec::with_capacity(2 * DECODER_MAX_SAMPLES),
            gate_open: false,
            had_data: false,
            fade_in_pending: false,
            last_sample: 0,
        }
    }
}

// =============================================================================
// Mixer
// =============================================================================

/// Result of one mixer cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No channel contributed; nothing was written
    Idle,
    /// A frame of this many interleaved samples was written
    Wrote(usize),
}

/// Mixes all active channels into the output sink
///
/// Owned and driven by a single thread; only the jitter queues and the
/// volume/pan atomics are shared with the rest of the session.
pub struct Mixer {
    channels: ChannelMap,
    sink: Box<dyn AudioSink>,
    gate_frames: usize,
    lanes: HashMap<String, Lane>,
    /// 32-bit stereo accumulator, interleaved
    mix: Vec<i32>,
    /// Converted output frame
    out: Vec<i16>,
    cycle: u64,
    underflow_total: u64,
}

impl Mixer {
    /// Create a mixer over the given channel set and sink
    pub fn new(channels: ChannelMap, sink: Box<dyn AudioSink>, gate_frames: usize) -> Self {
        Self {
            channels,
            sink,
            gate_frames,
            lanes: HashMap::new(),
            mix: vec![0i32; OUTPUT_FRAME_SHORTS],
            out: vec![0i16; OUTPUT_FRAME_SHORTS],
            cycle: 0,
            underflow_total: 0,
        }
    }

    /// Run cycles until `running` clears
    ///
    /// Exits after at most one further output write once the flag drops.
    pub fn run(&mut self, running: &Arc<AtomicBool>) {
        debug!(gate_frames = self.gate_frames, "mixer loop started");
        while running.load(Ordering::Relaxed) {
            if self.run_cycle() == CycleOutcome::Idle {
                std::thread::sleep(IDLE_BACKOFF);
            }
        }
        debug!(
            cycles = self.cycle,
            underflows = self.underflow_total,
            "mixer loop ended"
        );
    }

    /// Produce at most one output frame from the current channel set
    pub fn run_cycle(&mut self) -> CycleOutcome {
        // The snapshot taken here defines this cycle's contributors;
        // channels added mid-cycle begin next cycle.
        let snapshot = self.channels.snapshot();

        let live: HashSet<&str> = snapshot.iter().map(|c| c.id()).collect();
        self.lanes.retain(|id, _| live.contains(id.as_str()));

        self.mix.fill(0);
        self.cycle += 1;
        let mut active = 0usize;

        for channel in &snapshot {
            let lane = self
                .lanes
                .entry(channel.id().to_string())
                .or_insert_with(Lane::new);

            if !lane.gate_open {
                if channel.queue_len() < self.gate_frames {
                    continue;
                }
                lane.gate_open = true;
                debug!(channel = %channel.id(), "jitter gate opened");
            }

            while lane.acc.len() < MIXER_FRAME_SAMPLES {
                match channel.pop_frame() {
                    Some(frame) => lane.acc.extend_from_slice(&frame.samples),
                    None => break,
                }
            }

            if lane.acc.len() >= MIXER_FRAME_SAMPLES {
                let volume = channel.volume();
                let pan = channel.pan();
                let fade_in = lane.fade_in_pending;

                let mut last = 0i16;
                for i in 0..MIXER_FRAME_SAMPLES {
                    let mut value = lane.acc[i] as f32 * volume;
                    if fade_in && i < FADE_SAMPLES {
                        value *= i as f32 / FADE_SAMPLES as f32;
                    }
                    let sample = value as i32;
                    route(&mut self.mix, i, sample, pan);
                    last = sample as i16;
                }

                let len = lane.acc.len();
                lane.acc.copy_within(MIXER_FRAME_SAMPLES..len, 0);
                lane.acc.truncate(len - MIXER_FRAME_SAMPLES);

                lane.had_data = true;
                lane.fade_in_pending = false;
                lane.last_sample = last;
                active += 1;
            } else if lane.had_data && lane.last_sample != 0 {
                // The stream ran dry mid-signal: ramp the held sample down
                // to zero instead of cutting, which clicks.
                let pan = channel.pan();
                let start = lane.last_sample as i32;
                for i in 0..FADE_SAMPLES {
                    let sample = start * (FADE_SAMPLES - i) as i32 / FADE_SAMPLES as i32;
                    route(&mut self.mix, i, sample, pan);
                }

                self.underflow_total += 1;
                channel.note_underflow();
                debug!(
                    channel = %channel.id(),
                    total = self.underflow_total,
                    last_sample = start,
                    accumulated = lane.acc.len(),
                    "channel underflow, fading out"
                );

                lane.had_data = false;
                lane.last_sample = 0;
                lane.fade_in_pending = true;
                active += 1;
            } else if lane.had_data {
                // Ran dry on a zero sample: silence continues silence,
                // nothing to emit and no click to suppress.
                lane.had_data = false;
                lane.fade_in_pending = true;
            }
        }

        if active == 0 {
            return CycleOutcome::Idle;
        }

        // Whole-frame peak limiting: per-sample clamping distorts audibly,
        // uniform scaling preserves the waveform shape.
        let peak = self.mix.iter().map(|v| v.abs()).max().unwrap_or(0);
        let limited = peak > i16::MAX as i32;
        if limited {
            for value in self.mix.iter_mut() {
                *value = (*value as i64 * i16::MAX as i64 / peak as i64) as i32;
            }
        }

        for (out, value) in self.out.iter_mut().zip(self.mix.iter()) {
            *out = *value as i16;
        }

        match self.sink.write(&self.out) {
            Ok(n) if n == OUTPUT_FRAME_SHORTS => {}
            Ok(n) => warn!(written = n, "short write to output sink"),
            Err(e) => warn!(error = %e, "output sink write failed"),
        }

        if self.cycle % REPORT_EVERY_CYCLES == 0 {
            let queues: Vec<String> = snapshot
                .iter()
                .map(|c| format!("{}={}", c.id(), c.queue_len()))
                .collect();
            debug!(
                cycle = self.cycle,
                active,
                samples = OUTPUT_FRAME_SHORTS,
                peak,
                limited,
                underflows = self.underflow_total,
                queues = ?queues,
                "mixer cycle report"
            );
        }

        CycleOutcome::Wrote(OUTPUT_FRAME_SHORTS)
    }

    /// Total underflows across all channels since the mixer started
    pub fn underflow_total(&self) -> u64 {
        self.underflow_total
    }
}

/// Add a mono sample into the stereo accumulator at mono index `i`
fn route(mix: &mut [i32], i: usize, sample: i32, pan: Pan) {
    match pan {
        Pan::Left => mix[2 * i] += sample,
        Pan::Right => mix[2 * i + 1] += sample,
        Pan::Center => {
            mix[2 * i] += sample;
            mix[2 * i + 1] += sample;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chorus_common::voice::JITTER_GATE_FRAMES;

    use super::*;
    use crate::voice::channel::ChannelState;
    use crate::voice::jitter::PcmFrame;
    use crate::voice::sink::{BufferSink, BufferSinkHandle};

    fn channel(map: &ChannelMap, id: &str, volume: f32, pan: Pan) -> Arc<ChannelState> {
        let state = Arc::new(ChannelState::new(id, volume, pan).unwrap());
        assert!(map.insert(Arc::clone(&state)));
        state
    }

    fn mixer_with_sink(map: &ChannelMap, gate_frames: usize) -> (Mixer, BufferSinkHandle) {
        let sink = BufferSink::new();
        let handle = sink.handle();
        (Mixer::new(map.clone(), Box::new(sink), gate_frames), handle)
    }

    fn constant_frame(value: i16, len: usize) -> PcmFrame {
        PcmFrame::new(vec![value; len])
    }

    #[test]
    fn test_idle_without_channels() {
        let map = ChannelMap::new();
        let (mut mixer, handle) = mixer_with_sink(&map, 1);
        assert_eq!(mixer.run_cycle(), CycleOutcome::Idle);
        assert_eq!(handle.frame_count(), 0);
    }

    #[test]
    fn test_gate_holds_until_threshold() {
        let map = ChannelMap::new();
        let ch = channel(&map, "a", 1.0, Pan::Center);
        let (mut mixer, handle) = mixer_with_sink(&map, JITTER_GATE_FRAMES);

        for _ in 0..JITTER_GATE_FRAMES - 1 {
            ch.push_frame(constant_frame(1000, MIXER_FRAME_SAMPLES));
            assert_eq!(mixer.run_cycle(), CycleOutcome::Idle);
        }
        assert_eq!(handle.frame_count(), 0);

        // The threshold frame opens the gate
        ch.push_frame(constant_frame(1000, MIXER_FRAME_SAMPLES));
        assert_eq!(
            mixer.run_cycle(),
            CycleOutcome::Wrote(OUTPUT_FRAME_SHORTS)
        );
        assert_eq!(handle.frame_count(), 1);
    }

    /// Scenario: five queued frames of constant 1000 play back as five full
    /// unattenuated stereo frames once the gate opens.
    #[test]
    fn test_five_frames_of_constant_value_play_back_exactly() {
        let map = ChannelMap::new();
        let ch = channel(&map, "a", 1.0, Pan::Center);
        let (mut mixer, handle) = mixer_with_sink(&map, JITTER_GATE_FRAMES);

        for _ in 0..5 {
            ch.push_frame(constant_frame(1000, MIXER_FRAME_SAMPLES));
        }

        for _ in 0..5 {
            assert_eq!(
                mixer.run_cycle(),
                CycleOutcome::Wrote(OUTPUT_FRAME_SHORTS)
            );
        }

        let frames = handle.frames();
        assert_eq!(frames.len(), 5);
        for frame in &frames {
            assert_eq!(frame.len(), OUTPUT_FRAME_SHORTS);
            assert!(frame.iter().all(|&s| s == 1000), "every stereo slot is 1000");
        }
        assert_eq!(mixer.underflow_total(), 0);
    }

    /// Scenario: two panned channels, one at half volume, mixed from 100ms
    /// frames; residue of 960 samples carries in each lane.
    #[test]
    fn test_two_channels_pan_and_volume() {
        let map = ChannelMap::new();
        let a = channel(&map, "a", 1.0, Pan::Left);
        let b = channel(&map, "b", 0.5, Pan::Right);
        let (mut mixer, handle) = mixer_with_sink(&map, 1);

        a.push_frame(constant_frame(10_000, DECODER_MAX_SAMPLES));
        b.push_frame(constant_frame(20_000, DECODER_MAX_SAMPLES));

        for _ in 0..2 {
            assert_eq!(
                mixer.run_cycle(),
                CycleOutcome::Wrote(OUTPUT_FRAME_SHORTS)
            );
        }

        for frame in handle.frames() {
            for pair in frame.chunks_exact(2) {
                assert_eq!(pair[0], 10_000, "left carries channel a");
                assert_eq!(pair[1], 10_000, "right carries channel b at half gain");
            }
        }

        // floor(4800 / 1920) = 2 full frames; 960 samples remain per lane
        assert_eq!(mixer.lanes["a"].acc.len(), 960);
        assert_eq!(mixer.lanes["b"].acc.len(), 960);
        assert_eq!(mixer.underflow_total(), 0);
    }

    /// Scenario: when a channel runs dry mid-signal the mixer emits one
    /// fade-out frame, counts an underflow, and then goes idle without
    /// starving the sink.
    #[test]
    fn test_underflow_fades_out_then_idles() {
        let map = ChannelMap::new();
        let ch = channel(&map, "a", 1.0, Pan::Center);
        let (mut mixer, handle) = mixer_with_sink(&map, 1);

        for _ in 0..5 {
            ch.push_frame(constant_frame(1000, MIXER_FRAME_SAMPLES));
        }
        for _ in 0..5 {
            assert_eq!(
                mixer.run_cycle(),
                CycleOutcome::Wrote(OUTPUT_FRAME_SHORTS)
            );
        }

        // Dry cycle: a fade-out frame is still written
        assert_eq!(
            mixer.run_cycle(),
            CycleOutcome::Wrote(OUTPUT_FRAME_SHORTS)
        );
        assert_eq!(mixer.underflow_total(), 1);
        assert_eq!(ch.stats().underflows, 1);

        let frames = handle.frames();
        let fade = frames.last().unwrap();
        // Ramp starts at the held sample and falls monotonically to zero
        assert_eq!(fade[0], 1000);
        assert_eq!(fade[1], 1000);
        for i in 1..FADE_SAMPLES {
            assert!(fade[2 * i] <= fade[2 * (i - 1)]);
        }
        assert!(fade[2 * FADE_SAMPLES..].iter().all(|&s| s == 0));

        // Ten further dry cycles produce no writes and no new underflows
        for _ in 0..10 {
            assert_eq!(mixer.run_cycle(), CycleOutcome::Idle);
        }
        assert_eq!(handle.frame_count(), 6);
        assert_eq!(mixer.underflow_total(), 1);
    }

    #[test]
    fn test_resumed_stream_fades_in() {
        let map = ChannelMap::new();
        let ch = channel(&map, "a", 1.0, Pan::Center);
        let (mut mixer, handle) = mixer_with_sink(&map, 1);

        ch.push_frame(constant_frame(1000, MIXER_FRAME_SAMPLES));
        mixer.run_cycle(); // plays
        mixer.run_cycle(); // underflow fade-out

        ch.push_frame(constant_frame(1000, MIXER_FRAME_SAMPLES));
        mixer.run_cycle(); // resumes with fade-in

        let frames = handle.frames();
        let resumed = frames.last().unwrap();
        assert_eq!(resumed[0], 0, "fade-in starts from silence");
        assert!(resumed[2 * (FADE_SAMPLES / 2)] < 1000);
        assert_eq!(resumed[2 * FADE_SAMPLES], 1000, "full level after the fade");
    }

    #[test]
    fn test_gate_never_recloses() {
        let map = ChannelMap::new();
        let ch = channel(&map, "a", 1.0, Pan::Center);
        let (mut mixer, handle) = mixer_with_sink(&map, JITTER_GATE_FRAMES);

        for _ in 0..JITTER_GATE_FRAMES {
            ch.push_frame(constant_frame(1000, MIXER_FRAME_SAMPLES));
        }
        for _ in 0..JITTER_GATE_FRAMES {
            mixer.run_cycle();
        }
        mixer.run_cycle(); // fade-out after running dry

        // A single queued frame is far below the gate threshold, but the
        // gate is one-shot: the channel mixes immediately.
        ch.push_frame(constant_frame(500, MIXER_FRAME_SAMPLES));
        assert_eq!(
            mixer.run_cycle(),
            CycleOutcome::Wrote(OUTPUT_FRAME_SHORTS)
        );
        assert!(handle.frame_count() >= JITTER_GATE_FRAMES + 2);
    }

    /// Boundary: 100ms decoded frames produce 5 full mixer frames per 2
    /// inputs with no partial frames and no underflows while data lasts.
    #[test]
    fn test_full_decoder_frames_split_cleanly() {
        let map = ChannelMap::new();
        let ch = channel(&map, "a", 1.0, Pan::Center);
        let (mut mixer, handle) = mixer_with_sink(&map, 1);

        ch.push_frame(constant_frame(5000, DECODER_MAX_SAMPLES));
        ch.push_frame(constant_frame(5000, DECODER_MAX_SAMPLES));

        for _ in 0..5 {
            assert_eq!(
                mixer.run_cycle(),
                CycleOutcome::Wrote(OUTPUT_FRAME_SHORTS)
            );
        }
        assert_eq!(mixer.underflow_total(), 0);

        for frame in handle.frames() {
            assert!(frame.iter().all(|&s| s == 5000));
        }
        assert!(mixer.lanes["a"].acc.is_empty());
    }

    /// Boundary: 20ms decoded frames accumulate two-per-cycle with no
    /// partial-frame artifacts.
    #[test]
    fn test_small_decoder_frames_accumulate() {
        let map = ChannelMap::new();
        let ch = channel(&map, "a", 1.0, Pan::Center);
        let (mut mixer, handle) = mixer_with_sink(&map, 1);

        for _ in 0..10 {
            ch.push_frame(constant_frame(700, 960));
        }

        for _ in 0..5 {
            assert_eq!(
                mixer.run_cycle(),
                CycleOutcome::Wrote(OUTPUT_FRAME_SHORTS)
            );
        }
        assert_eq!(mixer.underflow_total(), 0);
        for frame in handle.frames() {
            assert!(frame.iter().all(|&s| s == 700));
        }
    }

    /// Two full-scale channels at center must be scaled by half, leaving a
    /// peak of exactly i16::MAX.
    #[test]
    fn test_peak_limiter_scales_uniformly() {
        let map = ChannelMap::new();
        let a = channel(&map, "a", 1.0, Pan::Center);
        let b = channel(&map, "b", 1.0, Pan::Center);
        let (mut mixer, handle) = mixer_with_sink(&map, 1);

        a.push_frame(constant_frame(i16::MAX, MIXER_FRAME_SAMPLES));
        b.push_frame(constant_frame(i16::MAX, MIXER_FRAME_SAMPLES));

        assert_eq!(
            mixer.run_cycle(),
            CycleOutcome::Wrote(OUTPUT_FRAME_SHORTS)
        );

        let frames = handle.frames();
        assert!(frames[0].iter().all(|&s| s == i16::MAX));
    }

    #[test]
    fn test_limiter_untouched_below_full_scale() {
        let map = ChannelMap::new();
        let ch = channel(&map, "a", 1.0, Pan::Center);
        let (mut mixer, handle) = mixer_with_sink(&map, 1);

        ch.push_frame(constant_frame(12_345, MIXER_FRAME_SAMPLES));
        mixer.run_cycle();

        assert!(handle.frames()[0].iter().all(|&s| s == 12_345));
    }

    #[test]
    fn test_volume_change_applies_next_cycle() {
        let map = ChannelMap::new();
        let ch = channel(&map, "a", 1.0, Pan::Center);
        let (mut mixer, handle) = mixer_with_sink(&map, 1);

        ch.push_frame(constant_frame(1000, MIXER_FRAME_SAMPLES));
        ch.push_frame(constant_frame(1000, MIXER_FRAME_SAMPLES));

        mixer.run_cycle();
        ch.set_volume(0.5);
        mixer.run_cycle();

        let frames = handle.frames();
        assert!(frames[0].iter().all(|&s| s == 1000));
        assert!(frames[1].iter().all(|&s| s == 500));
    }

    #[test]
    fn test_pan_routes_to_one_side() {
        let map = ChannelMap::new();
        let ch = channel(&map, "a", 1.0, Pan::Left);
        let (mut mixer, handle) = mixer_with_sink(&map, 1);

        ch.push_frame(constant_frame(800, MIXER_FRAME_SAMPLES));
        mixer.run_cycle();

        for pair in handle.frames()[0].chunks_exact(2) {
            assert_eq!(pair[0], 800);
            assert_eq!(pair[1], 0);
        }

        ch.set_pan(Pan::Right);
        ch.push_frame(constant_frame(800, MIXER_FRAME_SAMPLES));
        mixer.run_cycle();

        for pair in handle.frames()[1].chunks_exact(2) {
            assert_eq!(pair[0], 0);
            assert_eq!(pair[1], 800);
        }
    }

    #[test]
    fn test_silent_stream_stops_without_underflow() {
        let map = ChannelMap::new();
        let ch = channel(&map, "a", 1.0, Pan::Center);
        let (mut mixer, handle) = mixer_with_sink(&map, 1);

        ch.push_frame(constant_frame(0, MIXER_FRAME_SAMPLES));
        assert_eq!(
            mixer.run_cycle(),
            CycleOutcome::Wrote(OUTPUT_FRAME_SHORTS)
        );

        // Last sample was zero: the stream just stops, no fade, no count
        assert_eq!(mixer.run_cycle(), CycleOutcome::Idle);
        assert_eq!(mixer.underflow_total(), 0);
        assert_eq!(handle.frame_count(), 1);
    }

    #[test]
    fn test_removed_channel_drops_its_lane() {
        let map = ChannelMap::new();
        let ch = channel(&map, "a", 1.0, Pan::Center);
        let (mut mixer, _handle) = mixer_with_sink(&map, 1);

        ch.push_frame(constant_frame(1000, MIXER_FRAME_SAMPLES));
        mixer.run_cycle();
        assert!(mixer.lanes.contains_key("a"));

        map.remove("a");
        mixer.run_cycle();
        assert!(mixer.lanes.is_empty());
    }
}
