//! Blocking UDP client.
//!
//! Each logical request gets a random message id. If no matching reply arrives
//! within the timeout, the *same* envelope is sent again, which the server's
//! dedup cache answers without re-applying the command.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use prost::Message;
use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::protocol::{self, DecodeError, Envelope, Request, Response, MAX_DATAGRAM_LEN};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRIES: u32 = 3;

const MESSAGE_ID_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("no reply after {attempts} attempts")]
    Timeout { attempts: u32 },
}

pub struct KvClient {
    socket: UdpSocket,
    server: SocketAddr,
    timeout: Duration,
    retries: u32,
}

impl KvClient {
    /// Opens an ephemeral local socket for talking to `server`.
    pub fn connect(server: SocketAddr) -> Result<Self, ClientError> {
        let local = match server {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        Ok(Self {
            socket: UdpSocket::bind(local)?,
            server,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        })
    }

    /// How long to wait for a reply before retransmitting.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retransmissions after the first attempt.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sends `request` under a fresh random message id and waits for the reply,
    /// retransmitting on timeout.
    pub fn send(&self, request: &Request) -> Result<Response, ClientError> {
        self.send_with_id(&new_message_id(), request)
    }

    /// Sends `request` under a caller-chosen message id.
    pub fn send_with_id(&self, message_id: &[u8], request: &Request) -> Result<Response, ClientError> {
        let datagram = protocol::encode_envelope(message_id, &protocol::encode_request(request));
        let payload = self.exchange(message_id, &datagram)?;
        Ok(protocol::decode_response(&payload)?)
    }

    /// Sends a pre-encoded envelope and returns the payload of the reply that
    /// carries `message_id` and a valid checksum.
    pub fn exchange(&self, message_id: &[u8], datagram: &[u8]) -> Result<Vec<u8>, ClientError> {
        let attempts = self.retries + 1;
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

        for attempt in 1..=attempts {
            self.socket.send_to(datagram, self.server)?;
            if let Some(payload) = self.await_reply(message_id, &mut buf)? {
                return Ok(payload);
            }
            debug!(attempt, server = %self.server, "no reply, retransmitting");
        }
        Err(ClientError::Timeout { attempts })
    }

    /// Stores `value` under `key` with the given version.
    pub fn put(&self, key: &[u8], value: &[u8], version: i32) -> Result<Response, ClientError> {
        self.send(&Request::put(key, value, version))
    }

    /// Fetches the value and version stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Response, ClientError> {
        self.send(&Request::get(key))
    }

    /// Deletes `key`.
    pub fn remove(&self, key: &[u8]) -> Result<Response, ClientError> {
        self.send(&Request::remove(key))
    }

    fn await_reply(&self, message_id: &[u8], buf: &mut [u8]) -> Result<Option<Vec<u8>>, ClientError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.socket.set_read_timeout(Some(remaining))?;

            let (len, from) = match self.socket.recv_from(buf) {
                Ok(received) => received,
                Err(err)
                    if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            };
            if from != self.server {
                continue;
            }

            // Late replies to earlier requests and corrupt datagrams are skipped.
            match Envelope::decode(&buf[..len]) {
                Ok(envelope) if envelope.message_id == message_id && envelope.has_valid_checksum() => {
                    return Ok(Some(envelope.payload));
                }
                Ok(_) => debug!("ignoring unrelated reply"),
                Err(err) => debug!(error = ?err, "ignoring undecodable reply"),
            }
        }
    }
}

/// Fresh random message id.
pub fn new_message_id() -> Vec<u8> {
    let mut id = vec![0u8; MESSAGE_ID_LEN];
    rand::thread_rng().fill(&mut id[..]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_random() {
        let a = new_message_id();
        let b = new_message_id();
        assert_eq!(a.len(), MESSAGE_ID_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn silent_server_times_out_after_retries() {
        let silent = UdpSocket::bind("127.0.0.1:0").expect("bind silent peer");
        let client = KvClient::connect(silent.local_addr().expect("addr"))
            .expect("client")
            .with_timeout(Duration::from_millis(20))
            .with_retries(2);

        let err = client.get(b"k").expect_err("no reply expected");
        assert!(matches!(err, ClientError::Timeout { attempts: 3 }));

        // Every attempt carried the same envelope.
        silent.set_read_timeout(Some(Duration::from_millis(200))).expect("timeout");
        let mut buf = [0u8; 256];
        let mut seen = Vec::new();
        for _ in 0..3 {
            let (n, _) = silent.recv_from(&mut buf).expect("retransmission");
            seen.push(buf[..n].to_vec());
        }
        assert!(seen.windows(2).all(|w| w[0] == w[1]));
    }
}
