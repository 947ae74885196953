//! # Transport Layer
//!
//! TCP connections and the server that owns them.
//!
//! ## Responsibilities
//! - Accept sockets and wrap each in a [`Connection`]
//! - Read frames into one shared inbound queue, tagged by origin
//! - Write frames per connection in FIFO order, one at a time
//! - Retire closed connections and report them to the [`ServerHandler`]

pub mod connection;
pub mod handler;
pub mod server;

pub use connection::{Connection, ConnectionId, Inbox, OwnedMessage};
pub use handler::ServerHandler;
pub use server::Server;
