//! # Wire Codec
//!
//! Message framing and body encoding.
//!
//! ## Components
//! - **Message**: header plus a body used as a stack of integers
//! - **Codec**: Tokio codec that decodes a frame in two phases, header first
//!
//! ## Wire Format
//! ```text
//! [TypeId(4, LE)] [BodySize(4, LE)] [Body(BodySize)]
//! ```
//!
//! Body integers are little-endian `i32`s. Fields are popped back in the
//! reverse of the order they were pushed.
//!
//! ## Safety
//! - Declared body sizes are checked against the configured maximum before
//!   any body buffer is reserved

pub mod codec;
pub mod message;
