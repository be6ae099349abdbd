//! Composition root: builds the stores, handler, dispatcher and reactor.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::dedup::{DedupCache, DEFAULT_CACHE_MAX_BYTES};
use crate::dispatcher::{Dispatcher, DispatcherKind, DEFAULT_WORKERS};
use crate::handler::RequestHandler;
use crate::reactor::Reactor;
use crate::store::{BoundedStore, DEFAULT_STORE_MAX_BYTES};

/// Port the service listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 44221;

/// Everything needed to run a server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// One UDP channel is opened per address.
    pub bind: Vec<SocketAddr>,
    pub dispatcher: DispatcherKind,
    /// Pool size for [`DispatcherKind::Pooled`].
    pub workers: usize,
    pub store_max_bytes: usize,
    pub cache_max_bytes: usize,
    /// Drop inbound envelopes whose checksum does not match.
    pub verify_checksum: bool,
}

impl ServerConfig {
    /// Defaults with a single channel bound to `addr`.
    pub fn bound_to(addr: SocketAddr) -> Self {
        Self {
            bind: vec![addr],
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: vec![SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT))],
            dispatcher: DispatcherKind::Pooled,
            workers: DEFAULT_WORKERS,
            store_max_bytes: DEFAULT_STORE_MAX_BYTES,
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            verify_checksum: true,
        }
    }
}

/// A key-value server instance with its own store and dedup cache.
pub struct Server {
    reactor: Reactor,
    store: Arc<BoundedStore>,
    cache: Arc<DedupCache>,
}

impl Server {
    /// Builds the store, cache, handler and dispatcher for `config` and
    /// registers one channel per bind address. Nothing is bound until
    /// [`start`](Self::start).
    pub fn new(config: ServerConfig) -> Result<Self> {
        let store = Arc::new(BoundedStore::new(config.store_max_bytes));
        let cache = Arc::new(DedupCache::new(config.cache_max_bytes));
        let handler = RequestHandler::new(Arc::clone(&store), Arc::clone(&cache))
            .verify_checksum(config.verify_checksum);
        let dispatcher = Dispatcher::new(config.dispatcher, config.workers)
            .with_context(|| format!("failed to create {} dispatcher", config.dispatcher))?;

        let mut reactor = Reactor::new(Arc::new(handler), dispatcher);
        for addr in &config.bind {
            reactor.register_channel(*addr)?;
        }

        Ok(Self {
            reactor,
            store,
            cache,
        })
    }

    /// Binds every channel and begins serving requests.
    pub fn start(&mut self) -> Result<()> {
        self.reactor.start().context("failed to start reactor")?;
        info!(
            store_max_bytes = self.store.max_bytes(),
            cache_max_bytes = self.cache.max_bytes(),
            "kv server running"
        );
        Ok(())
    }

    /// Stops serving and releases the sockets. Safe to call more than once.
    pub fn stop(&mut self) {
        self.reactor.stop();
    }

    /// Addresses actually bound; empty before `start`.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.reactor.local_addrs()
    }

    pub fn store(&self) -> &Arc<BoundedStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<DedupCache> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_listens_on_service_port() {
        let config = ServerConfig::default();
        assert_eq!(config.bind, vec!["0.0.0.0:44221".parse::<SocketAddr>().expect("addr")]);
        assert_eq!(config.dispatcher, DispatcherKind::Pooled);
        assert_eq!(config.workers, 2);
        assert_eq!(config.store_max_bytes, 80 * 1024 * 1024);
        assert_eq!(config.cache_max_bytes, 8 * 1024 * 1024);
        assert!(config.verify_checksum);
    }

    #[test]
    fn zero_workers_fails_construction() {
        let config = ServerConfig {
            workers: 0,
            ..ServerConfig::bound_to("127.0.0.1:0".parse().expect("addr"))
        };
        assert!(Server::new(config).is_err());
    }
}
