//! UDP key-value service on a hand-rolled reactor.
//!
//! Clients send checksummed envelopes over UDP; each carries a message id and
//! an encoded key-value request. The server applies the request to a
//! byte-budgeted in-memory store and replies to the sender's address. Encoded
//! replies are memoized per message id, so a retransmitted request is answered
//! with the same bytes and never applied twice.
//!
//! # Architecture
//!
//! - **Reactor thread**: one thread polls every channel for readiness and reads
//!   datagrams
//! - **Dispatcher**: runs packet handling inline on the reactor thread or on a
//!   fixed worker pool
//! - **Handler**: decodes, consults the dedup cache, mutates the store, encodes
//!   the reply and writes it back through the channel it came from
//!
//! # Modules
//!
//! - [`store`]: byte-budgeted key-value map
//! - [`dedup`]: FIFO-evicting response cache keyed by message id
//! - [`protocol`]: envelope, request and response wire format
//! - [`handler`]: per-packet request processing
//! - [`channel`]: non-blocking UDP socket with a pending-write queue
//! - [`dispatcher`]: inline and pooled execution strategies
//! - [`reactor`]: readiness-polling event loop
//! - [`server`]: configuration and wiring
//! - [`client`]: blocking client with retransmission
//! - [`cli`]: command-line interface

pub mod channel;
pub mod cli;
pub mod client;
pub mod dedup;
pub mod dispatcher;
pub mod handler;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod store;
