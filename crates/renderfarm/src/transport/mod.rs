//! Connection plumbing.
//!
//! - **connection**: one stream, a reader task and a writer task, close-once
//! - **registry**: server-side set of live connections and the accept loop

pub mod connection;
pub mod registry;

pub use connection::{
    ChannelObserver, CloseReason, Connection, ConnectionConfig, ConnectionError, ConnectionEvent,
    ConnectionId, ConnectionObserver, OverflowPolicy, PendingConnection,
};
pub use registry::{RegistryError, SessionEvent, SessionRegistry};
