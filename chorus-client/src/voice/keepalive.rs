//! Keep-alive emission
//!
//! While the session is connected and no microphone transmission is in
//! progress, a `{"type":"KEEP_ALIVE"}` datagram goes to the destination on
//! a fixed interval so any intermediate NAT/firewall mapping stays warm.
//! Voice traffic refreshes the mapping by itself, so the task stays quiet
//! while the transmitter is active.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, trace};

use chorus_common::protocol::Envelope;

/// Sleep slice so teardown never waits a full interval
const TICK: Duration = Duration::from_millis(100);

/// Periodic keep-alive loop; runs until `running` clears
///
/// The first keep-alive goes out immediately so the NAT mapping opens as
/// soon as the session starts.
pub(crate) fn run_keepalive(
    socket: &UdpSocket,
    dest: SocketAddr,
    interval: Duration,
    running: &AtomicBool,
    transmitting: &AtomicBool,
) {
    let datagram = match Envelope::KeepAlive.to_datagram() {
        Ok(datagram) => datagram,
        Err(e) => {
            debug!(error = %e, "keep-alive envelope failed to pack, task disabled");
            return;
        }
    };

    let interval_ms = interval.as_millis() as u64;
    debug!(interval_ms, "keep-alive task started");

    while running.load(Ordering::Relaxed) {
        if !transmitting.load(Ordering::Relaxed) {
            match socket.send_to(&datagram, dest) {
                Ok(_) => trace!("keep-alive sent"),
                Err(e) => trace!(error = %e, "keep-alive send failed"),
            }
        }

        let mut slept = Duration::ZERO;
        while slept < interval && running.load(Ordering::Relaxed) {
            let step = TICK.min(interval - slept);
            std::thread::sleep(step);
            slept += step;
        }
    }

    debug!("keep-alive task ended");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    fn sockets() -> (UdpSocket, UdpSocket, SocketAddr) {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let dest = receiver.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        (sender, receiver, dest)
    }

    fn recv_count_within(receiver: &UdpSocket, window: Duration) -> usize {
        let mut buf = [0u8; 256];
        let deadline = Instant::now() + window;
        let mut count = 0;
        while Instant::now() < deadline {
            if let Ok((len, _)) = receiver.recv_from(&mut buf) {
                assert_eq!(
                    Envelope::from_datagram(&buf[..len]).unwrap(),
                    Envelope::KeepAlive
                );
                count += 1;
            }
        }
        count
    }

    #[test]
    fn test_keepalives_flow_on_interval() {
        let (sender, receiver, dest) = sockets();
        let running = Arc::new(AtomicBool::new(true));
        let transmitting = Arc::new(AtomicBool::new(false));

        let thread_running = Arc::clone(&running);
        let thread_transmitting = Arc::clone(&transmitting);
        let handle = std::thread::spawn(move || {
            run_keepalive(
                &sender,
                dest,
                Duration::from_millis(150),
                &thread_running,
                &thread_transmitting,
            );
        });

        // Immediate send plus at least one interval tick
        let count = recv_count_within(&receiver, Duration::from_millis(500));
        running.store(false, Ordering::Relaxed);
        handle.join().unwrap();

        assert!(count >= 2, "expected at least 2 keep-alives, got {}", count);
    }

    #[test]
    fn test_suppressed_while_transmitting() {
        let (sender, receiver, dest) = sockets();
        let running = Arc::new(AtomicBool::new(true));
        let transmitting = Arc::new(AtomicBool::new(true));

        let thread_running = Arc::clone(&running);
        let thread_transmitting = Arc::clone(&transmitting);
        let handle = std::thread::spawn(move || {
            run_keepalive(
                &sender,
                dest,
                Duration::from_millis(100),
                &thread_running,
                &thread_transmitting,
            );
        });

        let count = recv_count_within(&receiver, Duration::from_millis(400));
        assert_eq!(count, 0, "no keep-alives while transmitting");

        // Transmission ends: keep-alives resume
        transmitting.store(false, Ordering::Relaxed);
        let count = recv_count_within(&receiver, Duration::from_millis(400));
        running.store(false, Ordering::Relaxed);
        handle.join().unwrap();

        assert!(count >= 1, "keep-alives should resume after transmit ends");
    }
}
