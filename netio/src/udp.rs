//! UDP port: one socket, one receive thread, one send thread.
//!
//! Each thread owns its direction and talks to the pipeline exclusively
//! through channels, so packets from one port reach the pipeline in FIFO
//! order and the pipeline never blocks on a socket.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use wavecast_core::packet::pool::PacketPool;
use wavecast_core::packet::{Packet, UdpView};
use wavecast_core::pipeline::LoopWaker;

use crate::Error;

const IO_TICK: Duration = Duration::from_millis(100);

/// A bound UDP socket with dedicated I/O threads.
pub struct UdpPort {
    socket: UdpSocket,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl UdpPort {
    /// Binds a socket. Pass port 0 to let the OS pick one.
    pub fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(addr)?;
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "udp: bound");
        Ok(UdpPort {
            socket,
            local_addr,
            stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        })
    }

    /// Actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts the receive thread: datagrams become pool-backed packets
    /// pushed into `tx`, waking the pipeline loop after each one.
    pub fn start_recv(
        &mut self,
        pool: PacketPool,
        tx: Sender<Packet>,
        waker: Option<LoopWaker>,
    ) -> Result<(), Error> {
        let socket = self.socket.try_clone()?;
        socket.set_read_timeout(Some(IO_TICK))?;
        let stop = Arc::clone(&self.stop);
        let local_addr = self.local_addr;

        let handle = thread::Builder::new()
            .name(format!("udp-recv-{}", local_addr.port()))
            .spawn(move || {
                let mut scratch = vec![0u8; pool.buf_capacity()];
                while !stop.load(Ordering::Relaxed) {
                    let (len, src) = match socket.recv_from(&mut scratch) {
                        Ok(received) => received,
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            warn!(%local_addr, error = %e, "udp: recv failed");
                            break;
                        }
                    };

                    let Some(mut buf) = pool.allocate() else {
                        debug!(%local_addr, "udp: packet pool exhausted, datagram dropped");
                        continue;
                    };
                    buf.extend_from_slice(&scratch[..len]);
                    let mut packet = Packet::new(buf);
                    packet.udp = Some(UdpView {
                        src_addr: Some(src),
                        dst_addr: None,
                    });
                    packet.add_flags(Packet::FLAG_UDP);

                    if tx.send(packet).is_err() {
                        break; // pipeline went away
                    }
                    if let Some(waker) = &waker {
                        waker.wake();
                    }
                }
                debug!(%local_addr, "udp: recv thread stopped");
            })
            .expect("spawn udp recv thread");
        self.threads.push(handle);
        Ok(())
    }

    /// Starts the send thread draining `rx`. Packets without a destination
    /// address are dropped with a warning.
    pub fn start_send(&mut self, rx: Receiver<Packet>) -> Result<(), Error> {
        let socket = self.socket.try_clone()?;
        let stop = Arc::clone(&self.stop);
        let local_addr = self.local_addr;

        let handle = thread::Builder::new()
            .name(format!("udp-send-{}", local_addr.port()))
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let packet = match rx.recv_timeout(IO_TICK) {
                        Ok(packet) => packet,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    let dst = packet.udp.as_ref().and_then(|udp| udp.dst_addr);
                    let Some(dst) = dst else {
                        warn!(%local_addr, "udp: packet without destination dropped");
                        continue;
                    };
                    if let Err(e) = socket.send_to(&packet.buffer, dst) {
                        warn!(%local_addr, %dst, error = %e, "udp: send failed");
                    }
                }
                debug!(%local_addr, "udp: send thread stopped");
            })
            .expect("spawn udp send thread");
        self.threads.push(handle);
        Ok(())
    }
}

impl Drop for UdpPort {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use wavecast_core::packet::pool::Pool;

    #[test]
    fn test_datagram_becomes_packet() {
        let mut port = UdpPort::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let pool: PacketPool = Pool::new(16, 2048);
        let (tx, rx) = unbounded();
        port.start_recv(pool, tx, None).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"hello wavecast", port.local_addr()).unwrap();

        let packet = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(&*packet.buffer, b"hello wavecast");
        assert!(packet.has_flags(Packet::FLAG_UDP));
        assert_eq!(
            packet.udp.unwrap().src_addr.unwrap(),
            sender.local_addr().unwrap()
        );
    }

    #[test]
    fn test_send_thread_ships_to_destination() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let mut port = UdpPort::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let (tx, rx) = unbounded();
        port.start_send(rx).unwrap();

        let mut packet = Packet::new(
            wavecast_core::packet::pool::PoolBuf::unpooled(b"outbound".to_vec()),
        );
        packet.udp = Some(UdpView {
            src_addr: None,
            dst_addr: Some(receiver.local_addr().unwrap()),
        });
        packet.add_flags(Packet::FLAG_UDP);
        tx.send(packet).unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"outbound");
    }

    #[test]
    fn test_drop_joins_threads() {
        let mut port = UdpPort::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let pool: PacketPool = Pool::new(4, 512);
        let (tx, _rx) = unbounded();
        port.start_recv(pool, tx, None).unwrap();
        drop(port); // must not hang
    }
}
