//! Inter-process communication for the extension runtime
//!
//! This crate provides the message protocol and transport abstractions used
//! between the supervisor and its worker process.

pub mod error;
pub mod protocol;
pub mod transport;
pub mod transport_error;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{
    InvocationMeta, LogLevel, MessageEnvelope, StepMeta, SupervisorMessage, WorkerMessage,
    IPC_PROTOCOL_VERSION,
};
pub use transport::{FrameReader, FrameWriter, LineTransport, StdioTransport};
pub use transport_error::TransportError;
