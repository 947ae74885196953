//! # Error Types
//!
//! Error handling for the transport.
//!
//! Two families of failure live here. Contract violations (popping from an
//! empty queue, popping an integer from a body that is too short) are
//! returned to the immediate caller and indicate a bug or a protocol
//! desynchronization between peers. Transport failures (I/O errors, closed
//! connections) are mostly handled inside the connection chains and only
//! reach the application as an `on_disconnected` callback.
//!
//! ## Example Usage
//! ```rust
//! use tictoc_net::core::message::Message;
//! use tictoc_net::error::{TransportError, Result};
//!
//! fn read_cell(msg: &mut Message) -> Result<i32> {
//!     msg.pop_int()
//! }
//!
//! let mut msg = Message::new(3);
//! assert!(matches!(read_cell(&mut msg), Err(TransportError::ShortBody { len: 0 })));
//! ```

use std::io;
use thiserror::Error;

// TransportError is the primary error type for all transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Queue is empty")]
    EmptyQueue,

    #[error("Body too short to pop an integer: {len} bytes")]
    ShortBody { len: usize },

    #[error("Invalid message header")]
    InvalidHeader,

    #[error("Message body too large: {0} bytes")]
    OversizedBody(usize),

    #[error("Header declares {declared} body bytes but body holds {actual}")]
    BodySizeMismatch { declared: usize, actual: usize },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Type alias for Results using TransportError
pub type Result<T> = std::result::Result<T, TransportError>;
