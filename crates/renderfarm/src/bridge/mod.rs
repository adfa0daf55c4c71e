//! Wire layer shared by the coordinator and workers.
//!
//! - **codec**: length-prefixed framing over AsyncRead/AsyncWrite
//! - **protocol**: the tagged message set carried inside each frame

pub mod codec;
pub mod protocol;

pub use codec::{FrameCodec, TransportError};
pub use protocol::{FrameIndex, Message, MessageKind, ProtocolError};
