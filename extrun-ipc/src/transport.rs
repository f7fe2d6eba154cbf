//! Newline-delimited JSON transport
//!
//! Each frame is one `MessageEnvelope` serialized on a single line. The read
//! and write halves are separate types so the supervisor can run them on
//! different tasks.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, IPC_PROTOCOL_VERSION};

/// Default upper bound for a single frame
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Read half: decodes one envelope per line
pub struct FrameReader<R> {
    reader: BufReader<R>,
    max_frame_bytes: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            buf: Vec::new(),
        }
    }

    pub fn with_max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit;
        self
    }

    /// Next envelope. Blank lines are skipped; EOF yields `ConnectionClosed`.
    /// A malformed line yields `DeserializationError` and leaves the reader
    /// usable for the following line.
    ///
    /// Cancel safe: bytes of a partially read line are kept for the next call.
    pub async fn receive<T: for<'de> Deserialize<'de>>(
        &mut self,
    ) -> Result<MessageEnvelope<T>, IpcError> {
        loop {
            let read = self.reader.read_until(b'\n', &mut self.buf).await?;
            if read == 0 && self.buf.is_empty() {
                return Err(IpcError::ConnectionClosed);
            }

            let line = std::mem::take(&mut self.buf);
            if line.len() > self.max_frame_bytes {
                return Err(IpcError::FrameTooLarge {
                    size: line.len(),
                    limit: self.max_frame_bytes,
                });
            }

            let frame = std::str::from_utf8(&line)
                .map_err(|e| IpcError::DeserializationError(e.to_string()))?
                .trim();
            if frame.is_empty() {
                continue;
            }

            let envelope: MessageEnvelope<T> = serde_json::from_str(frame)
                .map_err(|e| IpcError::DeserializationError(e.to_string()))?;

            if envelope.protocol_version != IPC_PROTOCOL_VERSION {
                return Err(IpcError::ProtocolVersionMismatch {
                    expected: IPC_PROTOCOL_VERSION,
                    actual: envelope.protocol_version,
                });
            }

            return Ok(envelope);
        }
    }
}

/// Write half: encodes one envelope per line and flushes
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send<T: Serialize>(&mut self, message: &MessageEnvelope<T>) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| IpcError::SerializationError(e.to_string()))?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Wrap `message` in an envelope and send it
    pub async fn send_message<T: Serialize>(&mut self, message: T) -> Result<(), IpcError> {
        self.send(&MessageEnvelope::new(message)).await
    }

    pub async fn close(&mut self) -> Result<(), IpcError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Both halves of a line-delimited channel
pub struct LineTransport<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

/// Worker-side transport over the process's own stdin/stdout
pub type StdioTransport = LineTransport<tokio::io::Stdin, tokio::io::Stdout>;

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }

    pub fn into_split(self) -> (FrameReader<R>, FrameWriter<W>) {
        (self.reader, self.writer)
    }
}

impl StdioTransport {
    pub fn stdio() -> Self {
        LineTransport::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SupervisorMessage, WorkerMessage};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_frames_cross_a_pipe() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);

        writer.send_message(WorkerMessage::ready()).await.unwrap();
        writer
            .send_message(WorkerMessage::DcResponse {
                request_id: "r-1".to_string(),
                info: serde_json::json!({"tier": "gold"}),
                err: None,
            })
            .await
            .unwrap();

        let first: MessageEnvelope<WorkerMessage> = reader.receive().await.unwrap();
        assert_eq!(first.message, WorkerMessage::ready());
        let second: MessageEnvelope<WorkerMessage> = reader.receive().await.unwrap();
        assert!(matches!(second.message, WorkerMessage::DcResponse { .. }));
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut reader = FrameReader::new(b);
        let result = reader.receive::<SupervisorMessage>().await;
        assert!(matches!(result, Err(IpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_bad_line_does_not_poison_reader() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(b);

        a.write_all(b"\n{not json}\n").await.unwrap();
        let good = serde_json::to_string(&MessageEnvelope::new(SupervisorMessage::ready())).unwrap();
        a.write_all(format!("{}\n", good).as_bytes()).await.unwrap();

        let bad = reader.receive::<SupervisorMessage>().await;
        assert!(matches!(bad, Err(IpcError::DeserializationError(_))));
        let next = reader.receive::<SupervisorMessage>().await.unwrap();
        assert_eq!(next.message, SupervisorMessage::ready());
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(b);

        let mut envelope = MessageEnvelope::new(SupervisorMessage::ready());
        envelope.protocol_version = IPC_PROTOCOL_VERSION + 1;
        let line = serde_json::to_string(&envelope).unwrap();
        a.write_all(format!("{}\n", line).as_bytes()).await.unwrap();

        let result = reader.receive::<SupervisorMessage>().await;
        assert!(matches!(
            result,
            Err(IpcError::ProtocolVersionMismatch { expected: IPC_PROTOCOL_VERSION, .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(b).with_max_frame_bytes(8);

        a.write_all(b"0123456789abcdef\n").await.unwrap();
        let result = reader.receive::<SupervisorMessage>().await;
        assert!(matches!(result, Err(IpcError::FrameTooLarge { limit: 8, .. })));
    }

    #[tokio::test]
    async fn test_last_frame_without_newline() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(b);

        let line = serde_json::to_string(&MessageEnvelope::new(SupervisorMessage::ready())).unwrap();
        a.write_all(line.as_bytes()).await.unwrap();
        drop(a);

        let got = reader.receive::<SupervisorMessage>().await.unwrap();
        assert_eq!(got.message, SupervisorMessage::ready());
        assert!(matches!(
            reader.receive::<SupervisorMessage>().await,
            Err(IpcError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_partial_frame_survives_cancellation() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(b);

        let line = serde_json::to_string(&MessageEnvelope::new(SupervisorMessage::ready())).unwrap();
        let (head, tail) = line.split_at(line.len() / 2);
        a.write_all(head.as_bytes()).await.unwrap();

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            reader.receive::<SupervisorMessage>(),
        )
        .await;
        assert!(pending.is_err());

        a.write_all(format!("{}\n", tail).as_bytes()).await.unwrap();
        let got = reader.receive::<SupervisorMessage>().await.unwrap();
        assert_eq!(got.message, SupervisorMessage::ready());
    }

    #[tokio::test]
    async fn test_line_transport_splits_into_halves() {
        let (a_read, b_write) = tokio::io::duplex(1024);
        let (b_read, a_write) = tokio::io::duplex(1024);
        let (mut a_reader, mut a_writer) = LineTransport::new(a_read, a_write).into_split();
        let (mut b_reader, mut b_writer) = LineTransport::new(b_read, b_write).into_split();

        a_writer.send_message(WorkerMessage::ready()).await.unwrap();
        let got: MessageEnvelope<WorkerMessage> = b_reader.receive().await.unwrap();
        assert!(got.is_compatible());

        b_writer.send_message(SupervisorMessage::ready()).await.unwrap();
        let reply: MessageEnvelope<SupervisorMessage> = a_reader.receive().await.unwrap();
        assert_eq!(reply.message, SupervisorMessage::ready());

        a_writer.close().await.unwrap();
        assert!(matches!(
            b_reader.receive::<WorkerMessage>().await,
            Err(IpcError::ConnectionClosed)
        ));
    }
}
