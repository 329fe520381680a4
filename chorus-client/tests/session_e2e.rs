//! End-to-end session tests over loopback UDP
//!
//! A "peer" socket plays the relay: it feeds sealed Opus datagrams into the
//! session's socket and observes what the session sends back. The output
//! device is replaced by an in-memory sink.

use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use chorus_client::voice::capture::{FrameSource, SourceFactory};
use chorus_client::voice::sink::{AudioSink, BufferSink, BufferSinkHandle, SinkFactory};
use chorus_client::{Session, SessionConfig};
use chorus_common::crypto::{SecretKey, open, seal};
use chorus_common::protocol::Envelope;
use chorus_common::voice::{CAPTURE_FRAME_SAMPLES, OUTPUT_FRAME_SHORTS, SAMPLE_RATE};

const DEADLINE: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct Harness {
    peer: UdpSocket,
    key: SecretKey,
    session: Session,
    sink: BufferSinkHandle,
}

impl Harness {
    fn start(gate_frames: usize, keepalive_ms: u64) -> Self {
        init_tracing();

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();

        let key = SecretKey::generate();
        let dest = peer.local_addr().unwrap();
        let mut config =
            SessionConfig::new(dest.ip().to_string(), dest.port(), key.to_base64());
        config.jitter_gate_frames = gate_frames;
        config.keepalive_interval_ms = keepalive_ms;

        let sink = BufferSink::new();
        let handle = sink.handle();
        let factory: SinkFactory =
            Box::new(move || Ok(Box::new(sink) as Box<dyn AudioSink>));

        let session = Session::start_with_sink(config, factory).unwrap();

        Self {
            peer,
            key,
            session,
            sink: handle,
        }
    }

    /// Where the peer sends datagrams bound for the session
    fn session_addr(&self) -> SocketAddr {
        let port = self.session.local_addr().unwrap().port();
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn send_raw(&self, payload: &[u8]) {
        self.peer.send_to(payload, self.session_addr()).unwrap();
    }

    fn send_voice(&self, channel_id: &str, opus: &[u8]) {
        let sealed = seal(&self.key, opus).unwrap();
        let datagram = Envelope::audio(channel_id, &sealed).to_datagram().unwrap();
        self.send_raw(&datagram);
    }

    fn wait_until(&self, mut done: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + DEADLINE;
        while Instant::now() < deadline {
            if done(self) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        done(self)
    }
}

fn sine_frames(count: usize) -> Vec<Vec<u8>> {
    let mut encoder = opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
        .unwrap();
    (0..count)
        .map(|n| {
            let pcm: Vec<i16> = (0..CAPTURE_FRAME_SAMPLES)
                .map(|i| {
                    let t = (n * CAPTURE_FRAME_SAMPLES + i) as f32 / SAMPLE_RATE as f32;
                    (f32::sin(2.0 * std::f32::consts::PI * 440.0 * t) * 8000.0) as i16
                })
                .collect();
            let mut buf = vec![0u8; 1024];
            let len = encoder.encode(&pcm, &mut buf).unwrap();
            buf.truncate(len);
            buf
        })
        .collect()
}

#[test]
fn voice_flows_from_socket_to_sink() {
    let mut harness = Harness::start(3, 60_000);
    harness.session.add_channel("room").unwrap();

    for opus in sine_frames(10) {
        harness.send_voice("room", &opus);
        std::thread::sleep(Duration::from_millis(2));
    }

    assert!(
        harness.wait_until(|h| {
            h.session
                .stats("room")
                .is_some_and(|s| s.packets_received == 10)
        }),
        "all 10 frames should be decoded and enqueued"
    );
    assert!(
        harness.wait_until(|h| h.sink.frame_count() >= 10),
        "mixer should emit the received audio"
    );

    // Every written frame is exactly one interleaved stereo frame
    for frame in harness.sink.frames() {
        assert_eq!(frame.len(), OUTPUT_FRAME_SHORTS);
    }

    let stats = harness.session.stats("room").unwrap();
    assert_eq!(stats.auth_errors, 0);
    assert_eq!(stats.decode_errors, 0);
    assert!(stats.last_activity_ms > 0 || stats.packets_received > 0);

    harness.session.stop();
    assert!(!harness.session.is_running());
}

#[test]
fn hostile_traffic_is_counted_and_survived() {
    let mut harness = Harness::start(3, 60_000);
    harness.session.add_channel("room").unwrap();

    // Malformed JSON and binary garbage
    harness.send_raw(b"}}} garbage {{{");
    harness.send_raw(&[0xDE, 0xAD, 0xBE, 0xEF]);
    assert!(
        harness.wait_until(|h| h.session.malformed_datagrams() >= 2),
        "malformed datagrams should be counted"
    );

    // Authentic-looking datagram with a flipped tag bit
    let opus = sine_frames(1).remove(0);
    let mut sealed = seal(&harness.key, &opus).unwrap();
    let last = sealed.len() - 1;
    sealed[last] ^= 0x01;
    let datagram = Envelope::audio("room", &sealed).to_datagram().unwrap();
    harness.send_raw(&datagram);
    assert!(
        harness.wait_until(|h| h.session.stats("room").unwrap().auth_errors == 1),
        "tampered datagram should count an auth error"
    );

    // A payload that decrypts to junk the decoder rejects
    let mut junk = vec![0xFF, 0x00];
    junk.extend_from_slice(&[0x55; 14]);
    harness.send_voice("room", &junk);
    assert!(
        harness.wait_until(|h| h.session.stats("room").unwrap().decode_errors == 1),
        "undecodable payload should count a decode error"
    );

    // The pipeline still works afterwards
    harness.send_voice("room", &sine_frames(1)[0]);
    assert!(
        harness.wait_until(|h| h.session.stats("room").unwrap().packets_received == 1),
        "valid traffic should still flow after hostile traffic"
    );

    harness.session.stop();
}

#[test]
fn transmit_emits_decodable_audio_and_gates_keepalive() {
    let mut harness = Harness::start(3, 200);

    // Not transmitting: keep-alives arrive on the peer socket
    let mut buf = [0u8; 8192];
    let saw_keepalive = {
        let deadline = Instant::now() + DEADLINE;
        let mut seen = false;
        while !seen && Instant::now() < deadline {
            if let Ok((len, _)) = harness.peer.recv_from(&mut buf) {
                seen = matches!(
                    Envelope::from_datagram(&buf[..len]),
                    Ok(Envelope::KeepAlive)
                );
            }
        }
        seen
    };
    assert!(saw_keepalive, "keep-alives should flow while idle");

    // Scripted microphone: 20 frames of a 300 Hz tone
    let frames: Vec<Vec<i16>> = (0..20)
        .map(|n| {
            (0..CAPTURE_FRAME_SAMPLES)
                .map(|i| {
                    let t = (n * CAPTURE_FRAME_SAMPLES + i) as f32 / SAMPLE_RATE as f32;
                    (f32::sin(2.0 * std::f32::consts::PI * 300.0 * t) * 9000.0) as i16
                })
                .collect()
        })
        .collect();
    let factory: SourceFactory = Box::new(move || {
        struct Scripted(std::vec::IntoIter<Vec<i16>>);
        impl FrameSource for Scripted {
            fn next_frame(&mut self) -> Option<Vec<i16>> {
                self.0.next()
            }
        }
        Ok(Box::new(Scripted(frames.into_iter())) as Box<dyn FrameSource>)
    });

    harness
        .session
        .begin_transmit_with_source("my-room", factory)
        .unwrap();

    // Collect transmitted audio on the peer and verify the full wire stack
    let mut decoder = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono).unwrap();
    let mut audio_seen = 0usize;
    let deadline = Instant::now() + DEADLINE;
    while audio_seen < 20 && Instant::now() < deadline {
        let Ok((len, _)) = harness.peer.recv_from(&mut buf) else {
            continue;
        };
        let Ok(envelope) = Envelope::from_datagram(&buf[..len]) else {
            continue;
        };
        if let Envelope::Audio { channel_id, .. } = &envelope {
            assert_eq!(channel_id, "my-room");
            let sealed = envelope.sealed_payload().unwrap().unwrap();
            let opus_bytes = open(&harness.key, &sealed).unwrap();
            let mut pcm = vec![0i16; 4800];
            let n = decoder.decode(&opus_bytes, &mut pcm, false).unwrap();
            assert_eq!(n, CAPTURE_FRAME_SAMPLES);
            audio_seen += 1;
        }
    }
    assert_eq!(audio_seen, 20, "all scripted frames should arrive");
    assert_eq!(harness.session.transmit_stats().frames_sent, 20);

    // Source is dry but transmission is still active: keep-alives stay off
    harness.session.end_transmit();
    assert!(!harness.session.is_transmitting());

    // After end_transmit, keep-alives resume
    let resumed = {
        let deadline = Instant::now() + DEADLINE;
        let mut seen = false;
        while !seen && Instant::now() < deadline {
            if let Ok((len, _)) = harness.peer.recv_from(&mut buf) {
                seen = matches!(
                    Envelope::from_datagram(&buf[..len]),
                    Ok(Envelope::KeepAlive)
                );
            }
        }
        seen
    };
    assert!(resumed, "keep-alives should resume after transmission ends");

    harness.session.stop();
}
