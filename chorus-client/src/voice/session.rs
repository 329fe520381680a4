//! Session control
//!
//! A [`Session`] owns the datagram socket, the pre-shared key, the set of
//! active channels, and the long-lived threads: receiver, mixer, keep-alive,
//! and (while transmitting) the transmitter. The control surface is
//! synchronous method calls; the threads communicate only through the
//! per-channel jitter queues and atomic scalars.
//!
//! Teardown is deterministic: transmitter, then receiver, then mixer (its
//! sink drops with it), then keep-alive, then the channel map with its
//! decoders. The socket closes when the last thread releases it.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use chorus_common::crypto::{CryptoError, SecretKey};
use chorus_common::voice::Pan;

use crate::config::SessionConfig;

use super::capture::{AudioCapture, FrameSource, SourceFactory};
use super::channel::{ChannelMap, ChannelState, ChannelStats};
use super::codec::{CodecError, VoiceEncoder};
use super::dsp::CaptureChain;
use super::ingress;
use super::keepalive;
use super::mixer::Mixer;
use super::sink::{AudioSink, CpalSink, SinkError, SinkFactory};
use super::transmit::{TransmitCounters, TransmitStats, Transmitter};

// =============================================================================
// Constants
// =============================================================================

/// Receiver read timeout; bounds how long teardown waits on a quiet socket
const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// How long session start waits for the mixer thread to open its sink
const SINK_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Errors
// =============================================================================

/// Errors from the session control surface
#[derive(Debug, Error)]
pub enum SessionError {
    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The pre-shared key could not be loaded; the session does not start
    #[error("crypto initialization failed: {0}")]
    Crypto(#[from] CryptoError),

    /// Socket setup or thread spawn failed
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// Codec initialization failed
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The output sink could not be opened
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// `add_channel` with an id that is already active
    #[error("channel already exists: {0}")]
    ChannelExists(String),

    /// A control operation named an inactive channel
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// `begin_transmit` while a transmission is active
    #[error("a transmission is already active")]
    AlreadyTransmitting,

    /// The session has been stopped
    #[error("session is not running")]
    NotRunning,
}

// =============================================================================
// Shared State
// =============================================================================

/// State shared by the session threads
struct Shared {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    key: SecretKey,
    channels: ChannelMap,
    /// Datagrams discarded before reaching any channel
    malformed: AtomicU64,
    /// Reference point for last-activity timestamps
    epoch: Instant,
}

// =============================================================================
// Session
// =============================================================================

/// One voice session: socket, channels, and the engine threads
pub struct Session {
    shared: Arc<Shared>,
    config: SessionConfig,
    running: Arc<AtomicBool>,
    transmitting: Arc<AtomicBool>,
    tx_counters: Arc<TransmitCounters>,
    receiver: Option<JoinHandle<()>>,
    mixer: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
    transmitter: Option<Transmitter>,
}

impl Session {
    /// Start a session against the system default output device
    pub fn start(config: SessionConfig) -> Result<Self, SessionError> {
        Self::start_with_sink(
            config,
            Box::new(|| {
                CpalSink::open_default().map(|sink| Box::new(sink) as Box<dyn AudioSink>)
            }),
        )
    }

    /// Start a session with a caller-supplied output sink
    ///
    /// The factory runs on the mixer thread because device sinks are not
    /// `Send`; start fails if the sink cannot be opened.
    pub fn start_with_sink(
        config: SessionConfig,
        sink_factory: SinkFactory,
    ) -> Result<Self, SessionError> {
        config.validate().map_err(SessionError::Config)?;
        let key = SecretKey::from_base64(&config.key)?;

        let dest = (config.dest_host.as_str(), config.dest_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                SessionError::Config(format!("destination {} did not resolve", config.dest_host))
            })?;

        let bind_addr: SocketAddr = if dest.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr)?);
        socket.set_read_timeout(Some(RECV_POLL_TIMEOUT))?;

        let running = Arc::new(AtomicBool::new(true));
        let transmitting = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Shared {
            socket,
            dest,
            key,
            channels: ChannelMap::new(),
            malformed: AtomicU64::new(0),
            epoch: Instant::now(),
        });

        // The mixer thread opens the sink itself and reports back before
        // start returns, so a missing output device fails the start call.
        let (sink_tx, sink_rx) = std_mpsc::channel();
        let mixer_channels = shared.channels.clone();
        let mixer_running = Arc::clone(&running);
        let gate_frames = config.jitter_gate_frames;
        let mixer = std::thread::Builder::new()
            .name("chorus-mixer".to_string())
            .spawn(move || {
                let sink = match sink_factory() {
                    Ok(sink) => {
                        let _ = sink_tx.send(Ok(()));
                        sink
                    }
                    Err(e) => {
                        let _ = sink_tx.send(Err(e));
                        return;
                    }
                };
                Mixer::new(mixer_channels, sink, gate_frames).run(&mixer_running);
            })?;

        match sink_rx.recv_timeout(SINK_HANDSHAKE_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                running.store(false, Ordering::Relaxed);
                let _ = mixer.join();
                return Err(e.into());
            }
            Err(_) => {
                running.store(false, Ordering::Relaxed);
                let _ = mixer.join();
                return Err(SessionError::Sink(SinkError::Stream(
                    "sink initialization timed out".to_string(),
                )));
            }
        }

        let recv_shared = Arc::clone(&shared);
        let recv_running = Arc::clone(&running);
        let receiver = std::thread::Builder::new()
            .name("chorus-recv".to_string())
            .spawn(move || {
                ingress::run_receiver(
                    &recv_shared.socket,
                    &recv_shared.channels,
                    &recv_shared.key,
                    &recv_shared.malformed,
                    &recv_running,
                    recv_shared.epoch,
                );
            });
        let receiver = match receiver {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::Relaxed);
                let _ = mixer.join();
                return Err(e.into());
            }
        };

        let ka_shared = Arc::clone(&shared);
        let ka_running = Arc::clone(&running);
        let ka_transmitting = Arc::clone(&transmitting);
        let ka_interval = Duration::from_millis(config.keepalive_interval_ms);
        let keepalive = std::thread::Builder::new()
            .name("chorus-keepalive".to_string())
            .spawn(move || {
                keepalive::run_keepalive(
                    &ka_shared.socket,
                    ka_shared.dest,
                    ka_interval,
                    &ka_running,
                    &ka_transmitting,
                );
            });
        let keepalive = match keepalive {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::Relaxed);
                let _ = receiver.join();
                let _ = mixer.join();
                return Err(e.into());
            }
        };

        info!(dest = %dest, gate_frames, "session started");

        Ok(Self {
            shared,
            config,
            running,
            transmitting,
            tx_counters: Arc::new(TransmitCounters::default()),
            receiver: Some(receiver),
            mixer: Some(mixer),
            keepalive: Some(keepalive),
            transmitter: None,
        })
    }

    /// Stop all threads and release every resource; idempotent
    pub fn stop(&mut self) {
        let was_running =
            self.receiver.is_some() || self.mixer.is_some() || self.keepalive.is_some();

        self.transmitting.store(false, Ordering::Relaxed);
        self.running.store(false, Ordering::Relaxed);

        if let Some(transmitter) = self.transmitter.take() {
            transmitter.join();
        }
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.mixer.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.keepalive.take() {
            let _ = handle.join();
        }

        self.shared.channels.clear();

        if was_running {
            info!("session stopped");
        }
    }

    /// True until `stop` is called or the receiver hits an unrecoverable
    /// socket error
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Local address of the session socket
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }

    /// Add a channel with default volume (1.0) and pan (center)
    pub fn add_channel(&self, id: &str) -> Result<(), SessionError> {
        self.add_channel_with(id, 1.0, Pan::Center)
    }

    /// Add a channel; its gate starts closed and its decoder is created now
    ///
    /// Fails if the id is already active or the decoder cannot be
    /// initialized.
    pub fn add_channel_with(&self, id: &str, volume: f32, pan: Pan) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::NotRunning);
        }

        let state = Arc::new(ChannelState::new(id, volume, pan)?);
        if !self.shared.channels.insert(state) {
            return Err(SessionError::ChannelExists(id.to_string()));
        }

        info!(channel = %id, volume, pan = ?pan, "channel added");
        Ok(())
    }

    /// Remove a channel, dropping its queue, decoder, and runtime state
    ///
    /// Returns `false` if the id was not active.
    pub fn remove_channel(&self, id: &str) -> bool {
        let removed = self.shared.channels.remove(id).is_some();
        if removed {
            info!(channel = %id, "channel removed");
        }
        removed
    }

    /// Set a channel's volume, clamped to [0.0, 1.0]
    pub fn set_volume(&self, id: &str, volume: f32) -> Result<(), SessionError> {
        self.shared
            .channels
            .get(id)
            .ok_or_else(|| SessionError::UnknownChannel(id.to_string()))?
            .set_volume(volume);
        Ok(())
    }

    /// Set a channel's stereo routing
    pub fn set_pan(&self, id: &str, pan: Pan) -> Result<(), SessionError> {
        self.shared
            .channels
            .get(id)
            .ok_or_else(|| SessionError::UnknownChannel(id.to_string()))?
            .set_pan(pan);
        Ok(())
    }

    /// Counter snapshot for one channel
    pub fn stats(&self, id: &str) -> Option<ChannelStats> {
        self.shared.channels.get(id).map(|channel| channel.stats())
    }

    /// Number of active channels
    pub fn channel_count(&self) -> usize {
        self.shared.channels.len()
    }

    /// Datagrams discarded before they reached any channel
    pub fn malformed_datagrams(&self) -> u64 {
        self.shared.malformed.load(Ordering::Relaxed)
    }

    /// Start transmitting from the default microphone
    pub fn begin_transmit(&mut self, channel_id: &str) -> Result<(), SessionError> {
        self.begin_transmit_with_source(
            channel_id,
            Box::new(|| {
                AudioCapture::open_default()
                    .map(|capture| Box::new(capture) as Box<dyn FrameSource>)
            }),
        )
    }

    /// Start transmitting from a caller-supplied frame source
    ///
    /// Only one transmission may be active at a time. The encoder is
    /// created here so codec failures surface to the caller.
    pub fn begin_transmit_with_source(
        &mut self,
        channel_id: &str,
        source_factory: SourceFactory,
    ) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::NotRunning);
        }

        // A transmitter that aborted on its own (capture failure) left its
        // handle behind; reap it before deciding we are busy.
        if !self.transmitting.load(Ordering::Relaxed) {
            if let Some(stale) = self.transmitter.take() {
                stale.join();
            }
        }
        if self.transmitter.is_some() {
            return Err(SessionError::AlreadyTransmitting);
        }

        let encoder = VoiceEncoder::new()?;
        let chain = CaptureChain::new(self.config.noise_gate, self.config.agc);

        self.transmitting.store(true, Ordering::Relaxed);
        let spawned = Transmitter::spawn(
            Arc::clone(&self.shared.socket),
            self.shared.dest,
            self.shared.key.clone(),
            channel_id.to_string(),
            encoder,
            source_factory,
            chain,
            Arc::clone(&self.running),
            Arc::clone(&self.transmitting),
            Arc::clone(&self.tx_counters),
        );

        match spawned {
            Ok(transmitter) => {
                self.transmitter = Some(transmitter);
                info!(channel = %channel_id, "transmission started");
                Ok(())
            }
            Err(e) => {
                self.transmitting.store(false, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Stop the active transmission, if any, and release its encoder
    pub fn end_transmit(&mut self) {
        self.transmitting.store(false, Ordering::Relaxed);
        if let Some(transmitter) = self.transmitter.take() {
            transmitter.join();
            info!("transmission ended");
        }
    }

    /// True while a transmission is active
    pub fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::Relaxed)
    }

    /// Cumulative transmit counters for this session
    pub fn transmit_stats(&self) -> TransmitStats {
        self.tx_counters.snapshot()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Ensure the threads stop even if stop() was never called
        self.stop();
        debug!("session dropped");
    }
}

// =============================================================================
// Tests
// =============================================================================
