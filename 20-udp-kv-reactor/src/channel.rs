//! Non-blocking datagram channel.
//!
//! [`DatagramChannel`] owns one UDP socket registered with the reactor's
//! runtime. Reads happen only on the reactor thread. Writes may come from any
//! thread: a reply is sent immediately when the socket accepts it, otherwise it
//! is queued and the reactor is asked to flush once the socket is writable.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::warn;

struct OutboundPacket {
    payload: Vec<u8>,
    dest: SocketAddr,
}

pub struct DatagramChannel {
    socket: UdpSocket,
    local_addr: SocketAddr,
    pending: Mutex<VecDeque<OutboundPacket>>,
    write_interest: Notify,
    degraded: AtomicBool,
}

impl DatagramChannel {
    /// Binds a socket to `addr`.
    ///
    /// Must be called from within a Tokio runtime context with I/O enabled;
    /// the socket is registered with that runtime's driver.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = std::net::UdpSocket::bind(addr)?;
        Self::from_std(socket)
    }

    pub fn from_std(socket: std::net::UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            pending: Mutex::new(VecDeque::new()),
            write_interest: Notify::new(),
            degraded: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits until the socket may have a datagram to read.
    pub async fn readable(&self) -> io::Result<()> {
        self.socket.readable().await
    }

    /// Reads one datagram into `buf`.
    ///
    /// Returns `Ok(None)` if nothing is waiting; readiness is cleared in that
    /// case so the next [`readable`](Self::readable) actually waits.
    pub fn read_packet(&self, buf: &mut [u8]) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        match self.socket.try_recv_from(buf) {
            Ok((len, peer)) => Ok(Some((buf[..len].to_vec(), peer))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Sends `payload` to `dest`, queueing it if the socket is not ready.
    ///
    /// Writes are serialized per channel, so packets leave in the order this
    /// method was called. Queued packets keep the channel's write interest
    /// armed until [`flush_pending`](Self::flush_pending) drains them.
    pub fn write_packet(&self, payload: Vec<u8>, dest: SocketAddr) {
        let mut pending = self.pending();
        if pending.is_empty() {
            match self.socket.try_send_to(&payload, dest) {
                Ok(_) => return,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    self.record_error(&err);
                    return;
                }
            }
        }
        pending.push_back(OutboundPacket { payload, dest });
        drop(pending);
        self.write_interest.notify_one();
    }

    /// Sends queued packets until the queue is empty or the socket would block.
    ///
    /// Returns `true` when nothing is left queued. A packet that fails with a
    /// hard error is discarded so it cannot wedge the queue.
    pub fn flush_pending(&self) -> bool {
        let mut pending = self.pending();
        while let Some(packet) = pending.front() {
            match self.socket.try_send_to(&packet.payload, packet.dest) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return false,
                Err(err) => self.record_error(&err),
            }
            pending.pop_front();
        }
        true
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.pending().is_empty()
    }

    pub fn pending_writes(&self) -> usize {
        self.pending().len()
    }

    pub async fn writable(&self) -> io::Result<()> {
        self.socket.writable().await
    }

    /// Resolves after [`write_packet`](Self::write_packet) queues something.
    pub async fn write_requested(&self) {
        self.write_interest.notified().await
    }

    /// Whether a socket-level error has been observed on this channel.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub(crate) fn record_error(&self, err: &io::Error) {
        self.degraded.store(true, Ordering::Relaxed);
        warn!(addr = %self.local_addr, error = ?err, "datagram channel error");
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<OutboundPacket>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
