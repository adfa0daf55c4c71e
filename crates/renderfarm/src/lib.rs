//! renderfarm: distributed frame rendering over TCP.
//!
//! A coordinator hands frames of one job to any number of connected workers,
//! requeues whatever a lost or failing worker held, and reports results to
//! its host. Workers render through a pluggable [`Renderer`].

pub mod bridge;
pub mod coordinator;
pub mod server;
pub mod transport;
pub mod worker;

pub use bridge::{FrameIndex, Message, ProtocolError, TransportError};
pub use coordinator::{JobConfig, JobCoordinator, JobEvent, JobSummary};
pub use server::{DEFAULT_PORT, FarmServer, ServerConfig};
pub use transport::{CloseReason, ConnectionConfig, ConnectionId, OverflowPolicy};
pub use worker::{
    ProgressReporter, RenderError, Renderer, WorkerConfig, WorkerError, WorkerSummary, connect,
    run_worker,
};

/// Crate version, logged at startup by hosts.
pub const RENDERFARM_VERSION: &str = env!("CARGO_PKG_VERSION");
