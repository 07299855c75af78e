//! # UDP Radio Adapter
//!
//! Stands in for the raw radio NIC layer: each configured interface is a
//! UDP socket. The write half implements [`RadioTx`]; the read half is a
//! thread per interface that pushes received datagrams into the station
//! loop's crossbeam channel.

use anyhow::{Context, Result};
use bytes::Bytes;
use crossbeam_channel::Sender;
use quanta::Instant;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use aerolink_transport::wire::MAX_PACKET_TOTAL_SIZE;

use crate::net::interface::RadioTx;

/// Poll period of reader threads for the shutdown flag.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// One datagram off a radio interface.
#[derive(Debug, Clone)]
pub struct RadioFrame {
    /// Index of the interface in the selector.
    pub interface: usize,
    pub data: Bytes,
    pub received_at: Instant,
}

/// A radio interface backed by a UDP socket connected to the vehicle side.
pub struct UdpRadio {
    name: String,
    socket: UdpSocket,
}

impl UdpRadio {
    /// Bind `bind` and connect to `peer`.
    pub fn open(name: &str, bind: SocketAddr, peer: SocketAddr) -> Result<Self> {
        let socket =
            UdpSocket::bind(bind).with_context(|| format!("binding {name} to {bind}"))?;
        socket
            .connect(peer)
            .with_context(|| format!("connecting {name} to {peer}"))?;
        Ok(UdpRadio {
            name: name.to_string(),
            socket,
        })
    }

    pub fn from_socket(name: &str, socket: UdpSocket) -> Self {
        UdpRadio {
            name: name.to_string(),
            socket,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Clone of the socket for a reader thread.
    pub fn try_clone_socket(&self) -> Result<UdpSocket> {
        Ok(self.socket.try_clone()?)
    }
}

impl RadioTx for UdpRadio {
    fn send(&self, packet: &[u8], datarate: i32) -> Result<usize> {
        tracing::trace!(interface = %self.name, len = packet.len(), datarate, "radio tx");
        Ok(self.socket.send(packet)?)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Spawn a reader thread for one interface.
///
/// The thread exits when `shutdown` is set or the channel is closed.
pub fn spawn_reader(
    interface: usize,
    name: &str,
    socket: UdpSocket,
    frames: Sender<RadioFrame>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    socket.set_read_timeout(Some(READ_TIMEOUT))?;
    let thread_name = format!("rx-{name}");
    let handle = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let mut buf = vec![0u8; MAX_PACKET_TOTAL_SIZE + 1];
            while !shutdown.load(Ordering::Relaxed) {
                match socket.recv(&mut buf) {
                    Ok(n) => {
                        let frame = RadioFrame {
                            interface,
                            data: Bytes::copy_from_slice(&buf[..n]),
                            received_at: Instant::now(),
                        };
                        if frames.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                    Err(e) => {
                        tracing::warn!(interface, error = %e, "radio read failed");
                        std::thread::sleep(READ_TIMEOUT);
                    }
                }
            }
            tracing::debug!(interface, "radio reader stopped");
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_loopback_radio(name: &str) -> UdpRadio {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        socket.connect(addr).unwrap();
        UdpRadio::from_socket(name, socket)
    }

    #[test]
    fn radio_reports_name() {
        let radio = make_loopback_radio("wlan0");
        assert_eq!(radio.name(), "wlan0");
    }

    #[test]
    fn send_returns_bytes_written() {
        let radio = make_loopback_radio("wlan0");
        assert_eq!(radio.send(b"uplink", -1).unwrap(), 6);
    }

    #[test]
    fn reader_forwards_datagrams_and_stops() {
        let radio = make_loopback_radio("wlan0");
        let (tx, rx) = crossbeam_channel::bounded(8);
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle =
            spawn_reader(3, "wlan0", radio.try_clone_socket().unwrap(), tx, shutdown.clone())
                .unwrap();

        radio.send(b"hello", 0).unwrap();
        let frame = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.interface, 3);
        assert_eq!(&frame.data[..], b"hello");

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
