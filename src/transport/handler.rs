use std::sync::Arc;

use crate::transport::connection::{Connection, OwnedMessage};

/// Application callbacks driven by a [`Server`](crate::transport::server::Server).
///
/// `on_message` and `on_disconnected` run on the thread that calls
/// `update()` or `send_all()`; `on_connected` runs on an I/O worker as the
/// connection is accepted. The server holds the handler behind a mutex, so
/// callbacks must return quickly and must not call back into the server.
pub trait ServerHandler: Send + 'static {
    /// One inbound message, tagged with the connection it came from
    fn on_message(&mut self, message: OwnedMessage);

    /// A newly accepted connection, before it is registered
    fn on_connected(&mut self, connection: Arc<Connection>);

    /// A connection that was found closed and has left the registry
    fn on_disconnected(&mut self, connection: Arc<Connection>);
}
