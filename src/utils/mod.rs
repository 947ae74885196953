//! # Utility Modules
//!
//! Supporting pieces shared by the codec and the transport.
//!
//! ## Components
//! - **Queue**: mutex-guarded FIFO used as every mailbox in the transport
//! - **Logging**: structured logging configuration
//! - **Metrics**: thread-safe observability counters

pub mod logging;
pub mod metrics;
pub mod queue;

pub use metrics::{Metrics, MetricsSnapshot};
pub use queue::SyncQueue;
