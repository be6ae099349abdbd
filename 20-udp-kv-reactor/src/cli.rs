use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::dedup::DEFAULT_CACHE_MAX_BYTES;
use crate::dispatcher::{DispatcherKind, DEFAULT_WORKERS};
use crate::protocol::{Command as KvCommand, Request};
use crate::server::ServerConfig;
use crate::store::DEFAULT_STORE_MAX_BYTES;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the key-value server.
    Serve(ServeArgs),
    /// Send a single request to a running server.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// UDP address to listen on. Repeat to open several channels.
    #[arg(long, default_value = "0.0.0.0:44221")]
    pub bind: Vec<SocketAddr>,

    /// Where packet handling runs.
    #[arg(long, value_enum, default_value_t = DispatcherKind::Pooled)]
    pub dispatcher: DispatcherKind,

    /// Worker threads for the pooled dispatcher.
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Byte budget for stored keys and values.
    #[arg(long, default_value_t = DEFAULT_STORE_MAX_BYTES)]
    pub store_max_bytes: usize,

    /// Byte budget for cached responses.
    #[arg(long, default_value_t = DEFAULT_CACHE_MAX_BYTES)]
    pub cache_max_bytes: usize,

    /// Accept inbound envelopes even if their checksum does not match.
    #[arg(long)]
    pub no_verify_checksum: bool,
}

impl ServeArgs {
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            dispatcher: self.dispatcher,
            workers: self.workers,
            store_max_bytes: self.store_max_bytes,
            cache_max_bytes: self.cache_max_bytes,
            verify_checksum: !self.no_verify_checksum,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server.
    #[arg(long, default_value = "127.0.0.1:44221")]
    pub server: SocketAddr,

    /// Milliseconds to wait for a reply before retransmitting.
    #[arg(long, default_value_t = 100)]
    pub timeout_ms: u64,

    /// Retransmissions after the first attempt.
    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    #[command(subcommand)]
    pub op: ClientOp,
}

impl ClientArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum ClientOp {
    /// Store a value.
    Put {
        key: String,
        value: String,
        #[arg(long, default_value_t = 0)]
        version: i32,
    },
    /// Fetch a value.
    Get { key: String },
    /// Delete a key.
    Remove { key: String },
    /// Delete every key.
    WipeOut,
    IsAlive,
    GetPid,
    GetMembershipCount,
    Shutdown,
}

impl ClientOp {
    pub fn to_request(&self) -> Request {
        match self {
            Self::Put {
                key,
                value,
                version,
            } => Request::put(key.as_bytes(), value.as_bytes(), *version),
            Self::Get { key } => Request::get(key.as_bytes()),
            Self::Remove { key } => Request::remove(key.as_bytes()),
            Self::WipeOut => Request::new(KvCommand::WipeOut),
            Self::IsAlive => Request::new(KvCommand::IsAlive),
            Self::GetPid => Request::new(KvCommand::GetPid),
            Self::GetMembershipCount => Request::new(KvCommand::GetMembershipCount),
            Self::Shutdown => Request::new(KvCommand::Shutdown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["udp-kv-reactor", "serve"]).expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.into_config();
        assert_eq!(config.bind.len(), 1);
        assert_eq!(config.bind[0].port(), 44221);
        assert_eq!(config.dispatcher, DispatcherKind::Pooled);
        assert!(config.verify_checksum);
    }

    #[test]
    fn serve_accepts_several_binds_and_inline() {
        let cli = Cli::try_parse_from([
            "udp-kv-reactor",
            "serve",
            "--bind",
            "127.0.0.1:5000",
            "--bind",
            "127.0.0.1:5001",
            "--dispatcher",
            "inline",
            "--no-verify-checksum",
        ])
        .expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.into_config();
        assert_eq!(config.bind.len(), 2);
        assert_eq!(config.dispatcher, DispatcherKind::Inline);
        assert!(!config.verify_checksum);
    }

    #[test]
    fn client_put_builds_request() {
        let cli = Cli::try_parse_from([
            "udp-kv-reactor",
            "client",
            "put",
            "a",
            "1",
            "--version",
            "3",
        ])
        .expect("parse");
        let Command::Client(args) = cli.command else {
            panic!("expected client");
        };
        assert_eq!(args.op.to_request(), Request::put("a", "1", 3));
        assert_eq!(args.timeout(), Duration::from_millis(100));
    }
}
