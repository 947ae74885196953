//! # tictoc-net
//!
//! Message-oriented TCP transport: framed messages in, framed messages out.
//!
//! Every connection feeds one shared inbound queue that the application
//! polls; every connection drains its own outbound queue in order, one
//! frame at a time, no matter how many threads send to it.
//!
//! ## Modules
//! - [`core`]: header/body framing and the two-phase frame codec
//! - [`transport`]: connections, the server and the handler contract
//! - [`utils`]: the cross-context queue, logging and metrics
//! - [`config`]: server, transport and logging configuration
//! - [`error`]: error types

pub mod config;
pub mod core;
pub mod error;
pub mod transport;
pub mod utils;

pub use crate::core::message::{Header, Message, HEADER_SIZE};
pub use crate::error::{Result, TransportError};
pub use crate::transport::{Connection, ConnectionId, OwnedMessage, Server, ServerHandler};
