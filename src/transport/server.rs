//! # Server
//!
//! Owns the listening socket, the connection registry, the shared inbox and
//! the I/O runtime the connections run on.
//!
//! The server is driven from an ordinary thread: `update()` hands at most
//! one inbound message to the handler and never waits, `update_blocking()`
//! waits for one up to a timeout, and `send`/`send_all` only enqueue.
//! Connections found closed are retired, meaning removed from the registry
//! and reported through `on_disconnected`, exactly once each.
//!
//! ## Usage
//! ```rust,no_run
//! use std::sync::Arc;
//! use tictoc_net::config::NetworkConfig;
//! use tictoc_net::transport::{Connection, OwnedMessage, Server, ServerHandler};
//!
//! struct Echo;
//!
//! impl ServerHandler for Echo {
//!     fn on_message(&mut self, message: OwnedMessage) {
//!         if let Some(origin) = message.origin() {
//!             let _ = origin.send(message.into_message());
//!         }
//!     }
//!     fn on_connected(&mut self, _connection: Arc<Connection>) {}
//!     fn on_disconnected(&mut self, _connection: Arc<Connection>) {}
//! }
//!
//! # fn main() -> tictoc_net::error::Result<()> {
//! let server = Server::bind(&NetworkConfig::default(), Echo)?;
//! loop {
//!     server.update_blocking(std::time::Duration::from_millis(10));
//! }
//! # }
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{NetworkConfig, FIRST_CONNECTION_ID};
use crate::core::codec::FrameCodec;
use crate::core::message::Message;
use crate::error::Result;
use crate::transport::connection::{Connection, ConnectionId, Inbox};
use crate::transport::handler::ServerHandler;
use crate::utils::metrics::MetricsSnapshot;

type Registry = BTreeMap<ConnectionId, Arc<Connection>>;

/// State shared between the consumer-facing server and its accept loop
struct Shared<H> {
    inbox: Arc<Inbox>,
    registry: Mutex<Registry>,
    handler: Mutex<H>,
    next_id: AtomicU32,
    max_connections: usize,
    nodelay: bool,
    max_body_size: usize,
}

impl<H: ServerHandler> Shared<H> {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self) -> MutexGuard<'_, H> {
        self.handler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registered connections that are still open; closed ones awaiting
    /// retirement do not hold a slot
    fn live_connections(&self) -> usize {
        self.registry().values().filter(|c| c.is_connected()).count()
    }

    /// Wrap an accepted socket, announce it, register it, then start it
    fn accept_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if self.live_connections() >= self.max_connections {
            self.inbox.metrics().connection_rejected();
            warn!(peer = %peer, max = self.max_connections, "Max connections reached, rejecting");
            return;
        }

        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(peer = %peer, error = %e, "Unable to set TCP_NODELAY");
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(id, stream, self.inbox.clone());

        self.handler().on_connected(connection.clone());
        self.registry().insert(id, connection.clone());
        connection.start(FrameCodec::new(self.max_body_size));
    }

    /// Remove a connection from the registry and report it, unless that
    /// already happened
    fn retire(&self, id: ConnectionId) {
        let removed = self.registry().remove(&id);
        if let Some(connection) = removed {
            info!(conn_id = id, "Connection removed");
            self.handler().on_disconnected(connection);
        }
    }

    /// Retire closed connections whose inbound messages have all been
    /// delivered. The rest stay queued so `on_disconnected` follows their
    /// last message.
    fn reap_closed(&self) {
        let mut waiting = Vec::new();
        while let Ok(id) = self.inbox.closed().pop_front() {
            let undelivered = self.registry().get(&id).map_or(0, |c| c.undelivered());
            if undelivered == 0 {
                self.retire(id);
            } else {
                waiting.push(id);
            }
        }

        for id in waiting {
            self.inbox.closed().push_back(id);
        }
    }
}

#[instrument(name = "accept_loop", skip_all, fields(address = %address))]
async fn accept_loop<H: ServerHandler>(
    listener: TcpListener,
    address: SocketAddr,
    shared: Arc<Shared<H>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Accept loop stopped");
                return;
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => shared.accept_connection(stream, peer),
                    Err(e) => {
                        shared.inbox.metrics().accept_error();
                        error!(error = %e, "Unable to accept connection");
                    }
                }
            }
        }
    }
}

/// TCP message server driving a [`ServerHandler`]
pub struct Server<H: ServerHandler> {
    shared: Arc<Shared<H>>,
    runtime: Option<Runtime>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
}

impl<H: ServerHandler> Server<H> {
    /// Validate `config`, start the I/O runtime and begin accepting.
    ///
    /// Must be called from outside any async runtime.
    pub fn bind(config: &NetworkConfig, handler: H) -> Result<Self> {
        config.validate_strict()?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(config.server.io_threads)
            .thread_name("tictoc-io")
            .enable_all()
            .build()?;

        let listener = runtime.block_on(TcpListener::bind(&config.server.address))?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Server listening");

        let shared = Arc::new(Shared {
            inbox: Arc::new(Inbox::new()),
            registry: Mutex::new(BTreeMap::new()),
            handler: Mutex::new(handler),
            next_id: AtomicU32::new(FIRST_CONNECTION_ID),
            max_connections: config.server.max_connections,
            nodelay: config.transport.nodelay,
            max_body_size: config.transport.max_body_size,
        });

        let shutdown = CancellationToken::new();
        runtime.spawn(accept_loop(
            listener,
            local_addr,
            shared.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            shared,
            runtime: Some(runtime),
            local_addr,
            shutdown,
            shutdown_timeout: config.server.shutdown_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Deliver at most one inbound message to the handler, then retire
    /// closed connections that have nothing left to deliver.
    ///
    /// Returns whether a message was delivered. Never blocks on I/O.
    pub fn update(&self) -> bool {
        let delivered = match self.shared.inbox.messages().pop_front() {
            Ok(message) => {
                if let Some(origin) = message.origin() {
                    origin.mark_delivered();
                }
                self.shared.handler().on_message(message);
                true
            }
            Err(_) => false,
        };

        self.shared.reap_closed();
        delivered
    }

    /// Wait up to `timeout` for an inbound message, then [`update`](Self::update)
    pub fn update_blocking(&self, timeout: Duration) -> bool {
        self.shared.inbox.messages().wait_timeout(timeout);
        self.update()
    }

    /// Send to one connection, retiring it if it turns out to be closed
    pub fn send(&self, message: Message, connection: &Arc<Connection>) {
        if connection.is_connected() && connection.send(message).is_ok() {
            return;
        }

        debug!(conn_id = connection.id(), "Send to closed connection");
        self.shared.retire(connection.id());
    }

    /// Send to every open connection except `ignore`, retiring any found
    /// closed along the way
    pub fn send_all(&self, message: Message, ignore: Option<&Arc<Connection>>) {
        let dead: Vec<Arc<Connection>> = {
            let mut registry = self.shared.registry();
            let mut dead_ids = Vec::new();

            for (id, connection) in registry.iter() {
                let skip = ignore.is_some_and(|ignored| Arc::ptr_eq(ignored, connection));
                let alive = connection.is_connected()
                    && (skip || connection.send(message.clone()).is_ok());
                if !alive {
                    dead_ids.push(*id);
                }
            }

            dead_ids
                .into_iter()
                .filter_map(|id| registry.remove(&id))
                .collect()
        };

        if dead.is_empty() {
            return;
        }

        let mut handler = self.shared.handler();
        for connection in dead {
            info!(conn_id = connection.id(), "Connection removed");
            handler.on_disconnected(connection);
        }
    }

    /// Registered connection with the given id
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.shared.registry().get(&id).cloned()
    }

    /// Ids of all registered connections, ascending
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.shared.registry().keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry().len()
    }

    /// Inbound messages waiting for `update()`
    pub fn pending_messages(&self) -> usize {
        self.shared.inbox.messages().len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.inbox.metrics().snapshot()
    }

    pub fn log_metrics(&self) {
        self.shared.inbox.metrics().log_metrics();
    }

    /// Run `f` with exclusive access to the handler.
    ///
    /// `f` must not call back into this server.
    pub fn with_handler<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        let mut handler = self.shared.handler();
        f(&mut *handler)
    }

    /// Stop accepting, close every connection and stop the I/O runtime
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        info!("Shutting down server");
        self.shutdown.cancel();
        for connection in self.shared.registry().values() {
            connection.disconnect();
        }
        runtime.shutdown_timeout(self.shutdown_timeout);
    }
}

impl<H: ServerHandler> Drop for Server<H> {
    fn drop(&mut self) {
        self.stop();
    }
}
