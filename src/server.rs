//! Connection acceptor and process lifecycle
//!
//! Binds the IPv4 listening socket, prints where the server is
//! reachable, accepts connections, and spawns one session worker per
//! connection, capped at [`MAX_SESSIONS`]. Admission control is
//! accept-then-close: once the cap is reached a new connection is
//! accepted and immediately dropped, so the listen backlog cannot
//! shadow the cap.
//!
//! Shutdown is cooperative: a signal watcher cancels the shared token,
//! the accept loop stops, and every worker (each racing its reads
//! against the same token) unwinds and is joined.

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::mailbox::MailboxStore;
use crate::registry::{MAX_SESSIONS, SessionRegistry};
use crate::session::Session;
use crate::workers::{WorkerSlot, WorkerTable};
use futures::future::join_all;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The listening server plus its shared state.
pub struct Server {
    listener: tokio::net::TcpListener,
    store: Arc<MailboxStore>,
    registry: Arc<SessionRegistry>,
    workers: Arc<WorkerTable>,
    shutdown: CancellationToken,
    next_worker_id: u64,
}

impl Server {
    /// Bind the listening socket and print where the server is
    /// reachable.
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(MAX_SESSIONS as u32)?;

        let local = listener.local_addr()?;
        info!("listening on {local}");
        for ip in reachable_addresses() {
            info!("reachable at {ip}:{}", local.port());
        }

        Ok(Self {
            listener,
            store: Arc::new(MailboxStore::new(config.data_dir.clone())),
            registry: Arc::new(SessionRegistry::new()),
            workers: Arc::new(WorkerTable::new()),
            shutdown: CancellationToken::new(),
            next_worker_id: 0,
        })
    }

    /// The bound address (useful when the OS picked the port).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// A handle on the shutdown token, for embedding and tests.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown is requested, then join every
    /// worker.
    pub async fn run(mut self) -> Result<()> {
        spawn_signal_watcher(self.shutdown.clone());

        loop {
            let (stream, peer) = tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                },
            };
            debug!("connection accepted from {peer}");

            // Admission control: dropping the stream closes it before
            // any frame is consumed.
            if self.workers.occupied() >= MAX_SESSIONS {
                info!("session cap reached, closing connection from {peer}");
                continue;
            }

            let Some(slot) = self.claim_worker_slot().await else {
                break;
            };

            let id = self.next_worker_id;
            self.next_worker_id += 1;
            let store = Arc::clone(&self.store);
            let registry = Arc::clone(&self.registry);
            let token = self.shutdown.clone();
            let handle = tokio::spawn(async move {
                run_worker(stream, peer, id, store, registry, token).await;
            });
            self.workers.install(slot, WorkerSlot { id, handle });
        }

        self.shutdown.cancel();
        let workers = self.workers.drain();
        if !workers.is_empty() {
            info!("waiting for {} session worker(s)", workers.len());
        }
        for result in join_all(workers.into_iter().map(|w| w.handle)).await {
            if let Err(e) = result {
                warn!("session worker failed: {e}");
            }
        }
        info!("shutdown complete");
        Ok(())
    }

    /// Probe the worker table for a free slot, yielding while every
    /// slot is busy. `None` once shutdown is requested.
    async fn claim_worker_slot(&self) -> Option<usize> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            if let Some(slot) = self.workers.free_slot() {
                return Some(slot);
            }
            tokio::task::yield_now().await;
        }
    }
}

/// Drive one session to completion, racing it against shutdown, and
/// release its registry slot on every exit path.
async fn run_worker(
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    store: Arc<MailboxStore>,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
) {
    debug!("worker {id}: session with {peer}");
    let mut session = Session::new(stream, store, Arc::clone(&registry));

    tokio::select! {
        () = shutdown.cancelled() => debug!("worker {id}: cancelled by shutdown"),
        result = session.run() => match result {
            Ok(()) => debug!("worker {id}: session closed"),
            Err(Error::Disconnected) => debug!("worker {id}: peer disconnected"),
            Err(e) => warn!("worker {id}: session error: {e}"),
        },
    }

    if let Some(slot) = session.take_registry_slot() {
        registry.remove(slot).await;
    }
}

fn spawn_signal_watcher(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!("could not wait for SIGINT: {e}");
                    }
                }
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("could not install SIGTERM handler: {e}");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("could not wait for SIGINT: {e}");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("could not wait for SIGINT: {e}");
    }
}

/// Best-effort enumeration of non-loopback IPv4 interface addresses.
#[cfg(unix)]
fn reachable_addresses() -> Vec<Ipv4Addr> {
    match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs
            .filter_map(|ifa| ifa.address)
            .filter_map(|ss| ss.as_sockaddr_in().map(|sin| sin.ip()))
            .filter(|ip| !ip.is_loopback())
            .collect(),
        Err(e) => {
            debug!("could not enumerate interfaces: {e}");
            Vec::new()
        }
    }
}

#[cfg(not(unix))]
fn reachable_addresses() -> Vec<Ipv4Addr> {
    Vec::new()
}
