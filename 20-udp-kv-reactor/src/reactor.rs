//! Readiness-driven event loop over datagram channels.
//!
//! [`Reactor`] owns a single dedicated thread running a current-thread Tokio
//! runtime. Each registered channel gets a loop on that runtime that waits for
//! read readiness, pulls one datagram, and submits "handle and reply" to the
//! [`Dispatcher`]. The same loop flushes replies that could not be sent
//! immediately once the socket becomes writable.
//!
//! Lifecycle is `Created -> Started -> Stopped`; a stopped reactor cannot be
//! restarted.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::channel::DatagramChannel;
use crate::dispatcher::Dispatcher;
use crate::handler::PacketHandler;
use crate::protocol::MAX_DATAGRAM_LEN;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("reactor already started")]
    AlreadyStarted,
    #[error("reactor has been stopped")]
    Stopped,
    #[error("no channels registered")]
    NoChannels,
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to build reactor runtime")]
    Runtime(#[source] io::Error),
    #[error("failed to register socket with reactor runtime")]
    Register(#[source] io::Error),
    #[error("failed to spawn reactor thread")]
    Spawn(#[source] io::Error),
    #[error("reactor thread exited during startup")]
    StartupAborted,
}

enum State {
    Created { dispatcher: Dispatcher },
    Started(Running),
    Stopped,
}

struct Running {
    shutdown: watch::Sender<bool>,
    thread: JoinHandle<()>,
    channels: Vec<Arc<DatagramChannel>>,
}

pub struct Reactor {
    state: State,
    bind_addrs: Vec<SocketAddr>,
    handler: Arc<dyn PacketHandler>,
}

impl Reactor {
    /// Creates a reactor that will hand every datagram to `handler` through
    /// `dispatcher`. Channels are added with
    /// [`register_channel`](Self::register_channel).
    pub fn new(handler: Arc<dyn PacketHandler>, dispatcher: Dispatcher) -> Self {
        Self {
            state: State::Created { dispatcher },
            bind_addrs: Vec::new(),
            handler,
        }
    }

    /// Adds a UDP channel bound to `addr` when the reactor starts.
    pub fn register_channel(&mut self, addr: SocketAddr) -> Result<&mut Self, ReactorError> {
        match self.state {
            State::Created { .. } => {
                self.bind_addrs.push(addr);
                Ok(self)
            }
            State::Started(_) => Err(ReactorError::AlreadyStarted),
            State::Stopped => Err(ReactorError::Stopped),
        }
    }

    /// Binds every registered channel and starts the polling thread.
    ///
    /// A bind failure aborts startup and leaves the reactor in `Created`. The
    /// runtime is built and dropped on the reactor thread, so this may be
    /// called from inside another async runtime.
    pub fn start(&mut self) -> Result<(), ReactorError> {
        match self.state {
            State::Created { .. } => {}
            State::Started(_) => return Err(ReactorError::AlreadyStarted),
            State::Stopped => return Err(ReactorError::Stopped),
        }
        if self.bind_addrs.is_empty() {
            return Err(ReactorError::NoChannels);
        }

        let sockets = self
            .bind_addrs
            .iter()
            .map(|&addr| {
                std::net::UdpSocket::bind(addr).map_err(|source| ReactorError::Bind { addr, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let State::Created { dispatcher } = mem::replace(&mut self.state, State::Stopped) else {
            return Err(ReactorError::Stopped);
        };
        let kind = dispatcher.kind();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Startup>(1);

        let handler = Arc::clone(&self.handler);
        let thread = thread::Builder::new()
            .name("kv-reactor".to_string())
            .spawn(move || run_reactor_thread(sockets, handler, dispatcher, shutdown_rx, ready_tx))
            .map_err(ReactorError::Spawn)?;

        let channels = match ready_rx.recv() {
            Ok(Ok(channels)) => channels,
            Ok(Err((err, dispatcher))) => {
                let _ = thread.join();
                self.state = State::Created { dispatcher };
                return Err(err);
            }
            Err(_) => {
                if thread.join().is_err() {
                    warn!("reactor thread panicked during startup");
                }
                return Err(ReactorError::StartupAborted);
            }
        };

        let addrs: Vec<SocketAddr> = channels.iter().map(|c| c.local_addr()).collect();
        info!(?addrs, dispatcher = %kind, "reactor started");

        self.state = State::Started(Running {
            shutdown,
            thread,
            channels,
        });
        Ok(())
    }

    /// Stops polling, waits for in-flight work and closes the sockets.
    ///
    /// Calling it again, or on a reactor that never started, is a no-op apart
    /// from stopping the unused dispatcher.
    pub fn stop(&mut self) {
        match mem::replace(&mut self.state, State::Stopped) {
            State::Created { dispatcher } => dispatcher.stop(),
            State::Started(running) => {
                let _ = running.shutdown.send(true);
                if running.thread.join().is_err() {
                    warn!("reactor thread panicked");
                }
                let unsent: usize = running.channels.iter().map(|c| c.pending_writes()).sum();
                if unsent > 0 {
                    debug!(unsent, "discarding queued replies on stop");
                }
                info!("reactor stopped");
            }
            State::Stopped => {}
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Started(_))
    }

    /// Addresses the channels are actually bound to. Empty unless started.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.channels().iter().map(|c| c.local_addr()).collect()
    }

    pub fn channels(&self) -> &[Arc<DatagramChannel>] {
        match &self.state {
            State::Started(running) => &running.channels,
            _ => &[],
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Outcome reported by the reactor thread once its runtime is up. On failure
/// the dispatcher is handed back so the reactor can stay in `Created`.
type Startup = Result<Vec<Arc<DatagramChannel>>, (ReactorError, Dispatcher)>;

fn run_reactor_thread(
    sockets: Vec<std::net::UdpSocket>,
    handler: Arc<dyn PacketHandler>,
    dispatcher: Dispatcher,
    shutdown: watch::Receiver<bool>,
    ready: mpsc::SyncSender<Startup>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = ready.send(Err((ReactorError::Runtime(err), dispatcher)));
            return;
        }
    };

    let registered = {
        let _guard = runtime.enter();
        sockets
            .into_iter()
            .map(|socket| DatagramChannel::from_std(socket).map(Arc::new))
            .collect::<io::Result<Vec<_>>>()
    };
    let channels = match registered {
        Ok(channels) => channels,
        Err(err) => {
            let _ = ready.send(Err((ReactorError::Register(err), dispatcher)));
            return;
        }
    };

    let dispatcher = Arc::new(dispatcher);
    if ready.send(Ok(channels.clone())).is_ok() {
        runtime.block_on(run_event_loop(channels, handler, Arc::clone(&dispatcher), shutdown));
    }
    // Workers may still be replying, so drain them while the runtime that
    // owns the sockets is alive.
    dispatcher.stop();
}

async fn run_event_loop(
    channels: Vec<Arc<DatagramChannel>>,
    handler: Arc<dyn PacketHandler>,
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Receiver<bool>,
) {
    let mut loops = JoinSet::new();
    for channel in channels {
        loops.spawn(serve_channel(
            channel,
            Arc::clone(&handler),
            Arc::clone(&dispatcher),
            shutdown.clone(),
        ));
    }
    while let Some(result) = loops.join_next().await {
        if let Err(err) = result {
            warn!(error = ?err, "channel loop ended abnormally");
        }
    }
}

async fn serve_channel(
    channel: Arc<DatagramChannel>,
    handler: Arc<dyn PacketHandler>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let want_write = channel.has_pending_writes();
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            ready = channel.writable(), if want_write => {
                if let Err(err) = ready {
                    channel.record_error(&err);
                    break;
                }
                channel.flush_pending();
            }
            ready = channel.readable() => {
                if let Err(err) = ready {
                    channel.record_error(&err);
                    break;
                }
                match channel.read_packet(&mut buf) {
                    Ok(Some((datagram, peer))) => {
                        submit_packet(&dispatcher, &handler, &channel, datagram, peer);
                    }
                    Ok(None) => {}
                    Err(err) => channel.record_error(&err),
                }
            }
            _ = channel.write_requested() => {}
        }
    }
    debug!(addr = %channel.local_addr(), "channel loop exiting");
}

fn submit_packet(
    dispatcher: &Dispatcher,
    handler: &Arc<dyn PacketHandler>,
    channel: &Arc<DatagramChannel>,
    datagram: Vec<u8>,
    peer: SocketAddr,
) {
    let handler = Arc::clone(handler);
    let channel = Arc::clone(channel);
    dispatcher.submit(Box::new(move || {
        if let Some(reply) = handler.handle_packet(&datagram, peer) {
            channel.write_packet(reply, peer);
        }
    }));
}
