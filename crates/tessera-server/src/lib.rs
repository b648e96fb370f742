//! # tessera-server
//!
//! The node runtime: configuration from the environment, assembly of the
//! holder/cluster/syncer trio, the broadcast transport seam, background
//! tasks and graceful shutdown. The `tessera-server` binary in this crate
//! is a thin wrapper over [`server::ServerBuilder`].

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod metrics;
pub mod server;
pub mod transport;

pub use config::{Config, MetricService};
pub use error::ServerError;
pub use metrics::ServerMetrics;
pub use server::{Server, ServerBuilder};
pub use transport::{BroadcastRelay, MemoryTransport, MessageHandler, Transport};
