//! Per-packet request processing.
//!
//! A datagram moves through `decode envelope -> dedup lookup -> decode request
//! -> apply -> record -> reply`. Packets that cannot be understood are dropped
//! with a [`DropReason`] and get no reply. Requests that decode but carry bad
//! contents are answered with an error code instead.

use std::net::SocketAddr;
use std::sync::Arc;

use prost::Message;
use thiserror::Error;
use tracing::debug;

use crate::dedup::DedupCache;
use crate::protocol::{
    self, Command, DecodeError, Envelope, ErrorCode, Request, Response, MAX_KEY_LEN,
    MAX_VALUE_LEN,
};
use crate::store::BoundedStore;

/// Work performed for every datagram a channel receives.
///
/// Returning `None` means the packet is dropped and nothing is sent back.
pub trait PacketHandler: Send + Sync + 'static {
    fn handle_packet(&self, datagram: &[u8], peer: SocketAddr) -> Option<Vec<u8>>;
}

/// Why a datagram produced no reply.
#[derive(Debug, Error)]
pub enum DropReason {
    #[error(transparent)]
    MalformedEnvelope(DecodeError),
    #[error("envelope carries no message id")]
    MissingMessageId,
    #[error("checksum mismatch: envelope says {received:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { received: u64, computed: u32 },
    #[error(transparent)]
    MalformedRequest(DecodeError),
}

/// Applies key-value requests to a [`BoundedStore`], memoizing every encoded
/// response in a [`DedupCache`] under the request's message id.
pub struct RequestHandler {
    store: Arc<BoundedStore>,
    cache: Arc<DedupCache>,
    verify_checksum: bool,
    pid: i32,
}

impl RequestHandler {
    pub fn new(store: Arc<BoundedStore>, cache: Arc<DedupCache>) -> Self {
        Self {
            store,
            cache,
            verify_checksum: true,
            pid: i32::try_from(std::process::id()).unwrap_or(i32::MAX),
        }
    }

    /// Enables or disables rejection of inbound envelopes whose checksum does
    /// not match their contents. Enabled by default.
    pub fn verify_checksum(mut self, enabled: bool) -> Self {
        self.verify_checksum = enabled;
        self
    }

    /// Turns one inbound datagram into the encoded reply envelope.
    ///
    /// A message id seen before is answered from the cache with the original
    /// response bytes in a freshly checksummed envelope, without touching the
    /// store.
    pub fn process(&self, datagram: &[u8]) -> Result<Vec<u8>, DropReason> {
        let envelope = protocol::decode_envelope(datagram).map_err(DropReason::MalformedEnvelope)?;
        if envelope.message_id.is_empty() {
            return Err(DropReason::MissingMessageId);
        }
        if self.verify_checksum && !envelope.has_valid_checksum() {
            return Err(DropReason::ChecksumMismatch {
                received: envelope.checksum,
                computed: envelope.expected_checksum(),
            });
        }

        let Envelope {
            message_id,
            payload,
            ..
        } = envelope;

        if let Some(cached) = self.cache.get(&message_id) {
            debug!(bytes = cached.len(), "answering duplicate from cache");
            return Ok(Envelope::seal(message_id, cached.to_vec()).encode_to_vec());
        }

        let request = protocol::decode_request(&payload).map_err(DropReason::MalformedRequest)?;
        let response = protocol::encode_response(&self.apply(request));
        self.cache.put(&message_id, &response);

        Ok(Envelope::seal(message_id, response).encode_to_vec())
    }

    /// Executes a decoded request against the store.
    pub fn apply(&self, request: Request) -> Response {
        match Command::from_code(request.command) {
            Some(Command::Put) => self.put(request),
            Some(Command::Get) => self.get(&request.key),
            Some(Command::Remove) => self.remove(&request.key),
            Some(Command::WipeOut) => {
                self.store.wipe();
                Response::ok()
            }
            // Older servers answered code 7 with UNRECOGNIZED_COMMAND; this one
            // reports its process id.
            Some(Command::GetPid) => Response {
                pid: Some(self.pid),
                ..Response::ok()
            },
            // Membership and liveness are placeholders; shutdown is a no-op.
            Some(Command::IsAlive | Command::GetMembershipCount | Command::Shutdown) => {
                Response::ok()
            }
            None => Response::with_code(ErrorCode::UnrecognizedCommand),
        }
    }

    fn put(&self, request: Request) -> Response {
        if !valid_key(&request.key) {
            return Response::with_code(ErrorCode::InvalidKey);
        }
        if !valid_value(&request.value) {
            return Response::with_code(ErrorCode::InvalidValue);
        }
        if !self.store.put(&request.key, request.value, request.version) {
            // Out-of-space rejections are reported as NON_EXISTENT_KEY for wire
            // compatibility with existing clients.
            return Response::with_code(ErrorCode::NonExistentKey);
        }
        Response::ok()
    }

    fn get(&self, key: &[u8]) -> Response {
        if !valid_key(key) {
            return Response::with_code(ErrorCode::InvalidKey);
        }
        match self.store.get(key) {
            Some(entry) => Response {
                value: Some(entry.value.clone()),
                version: Some(entry.version),
                ..Response::ok()
            },
            None => Response::with_code(ErrorCode::NonExistentKey),
        }
    }

    fn remove(&self, key: &[u8]) -> Response {
        if !valid_key(key) {
            return Response::with_code(ErrorCode::InvalidKey);
        }
        if !self.store.remove(key) {
            return Response::with_code(ErrorCode::NonExistentKey);
        }
        Response::ok()
    }
}

impl PacketHandler for RequestHandler {
    fn handle_packet(&self, datagram: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
        match self.process(datagram) {
            Ok(reply) => Some(reply),
            Err(reason) => {
                debug!(peer = %peer, %reason, "dropping packet");
                None
            }
        }
    }
}

fn valid_key(key: &[u8]) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_LEN
}

fn valid_value(value: &[u8]) -> bool {
    !value.is_empty() && value.len() <= MAX_VALUE_LEN
}
