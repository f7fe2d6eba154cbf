//! IPC error types

use thiserror::Error;

/// Errors raised while moving frames between supervisor and worker
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    /// The other end closed its side of the channel
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Nothing to send on: the channel to the worker is gone
    #[error("Transport not connected")]
    NotConnected,

    #[error("Frame too large: {size} bytes (limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },
}

impl IpcError {
    /// The channel survives this error; the next frame may still be read
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IpcError::DeserializationError(_) | IpcError::InvalidMessage(_)
        )
    }

    /// The channel is unusable after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::ConnectionClosed
                | IpcError::NotConnected
                | IpcError::IoError(_)
                | IpcError::ProtocolVersionMismatch { .. }
                | IpcError::FrameTooLarge { .. }
        )
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::IoError(err.to_string())
        } else if err.is_data() || err.is_syntax() || err.is_eof() {
            IpcError::DeserializationError(err.to_string())
        } else {
            IpcError::SerializationError(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recoverable() {
        assert!(IpcError::DeserializationError("bad frame".to_string()).is_recoverable());
        assert!(IpcError::InvalidMessage("bad format".to_string()).is_recoverable());
        assert!(!IpcError::ConnectionClosed.is_recoverable());
        assert!(!IpcError::FrameTooLarge { size: 10, limit: 5 }.is_recoverable());
    }

    #[test]
    fn test_error_fatal() {
        assert!(IpcError::ConnectionClosed.is_fatal());
        assert!(IpcError::ProtocolVersionMismatch { expected: 1, actual: 2 }.is_fatal());
        assert!(IpcError::IoError("broken pipe".to_string()).is_fatal());
        assert!(!IpcError::DeserializationError("bad frame".to_string()).is_fatal());
    }

    #[test]
    fn test_from_serde_error() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let ipc: IpcError = err.into();
        assert!(matches!(ipc, IpcError::DeserializationError(_)));
    }
}
