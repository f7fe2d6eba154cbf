//! Queued frame writing
//!
//! Any task may enqueue a message through an [`Outbox`]; a single writer task
//! owns the [`FrameWriter`] and puts frames on the wire in enqueue order.
//! When every `Outbox` clone is gone the writer shuts its stream down, which
//! the other end observes as end-of-file.

use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, trace};

use crate::ipc::{FrameWriter, IpcError};

/// Item queued for the writer task
pub enum Outbound<M> {
    Frame(M),
    /// Resolved once every frame queued before it has been written
    Flush(oneshot::Sender<()>),
}

/// Cloneable sending side of a writer task
pub struct Outbox<M> {
    tx: mpsc::UnboundedSender<Outbound<M>>,
}

impl<M> Clone for Outbox<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M> std::fmt::Debug for Outbox<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<M: Send + 'static> Outbox<M> {
    /// Outbox plus the receiving end a writer task drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound<M>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, message: M) -> Result<(), IpcError> {
        self.tx
            .send(Outbound::Frame(message))
            .map_err(|_| IpcError::NotConnected)
    }

    /// Wait until everything queued so far is on the wire
    pub async fn flush(&self) -> Result<(), IpcError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Outbound::Flush(done_tx))
            .map_err(|_| IpcError::NotConnected)?;
        done_rx.await.map_err(|_| IpcError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the task that owns `writer`
pub fn spawn_writer<M, W>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::UnboundedReceiver<Outbound<M>>,
) -> JoinHandle<()>
where
    M: Serialize + Send + Sync + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Frame(message) => {
                    if let Err(e) = writer.send_message(message).await {
                        error!("IPC transport error: {}", e);
                        break;
                    }
                }
                Outbound::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }

        trace!("Outbox drained, closing stream");
        let _ = writer.close().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{FrameReader, MessageEnvelope, SupervisorMessage};

    #[tokio::test]
    async fn test_frames_written_in_order_then_closed() {
        let (a, b) = tokio::io::duplex(4096);
        let (outbox, rx) = Outbox::<SupervisorMessage>::channel();
        let writer = spawn_writer(FrameWriter::new(a), rx);

        outbox.send(SupervisorMessage::ready()).unwrap();
        outbox
            .send(SupervisorMessage::SystemLog {
                level: None,
                arguments: vec![serde_json::json!("hello")],
            })
            .unwrap();
        outbox.flush().await.unwrap();
        drop(outbox);
        writer.await.unwrap();

        let mut reader = FrameReader::new(b);
        let first: MessageEnvelope<SupervisorMessage> = reader.receive().await.unwrap();
        assert_eq!(first.message.kind(), "ready");
        let second: MessageEnvelope<SupervisorMessage> = reader.receive().await.unwrap();
        assert_eq!(second.message.kind(), "systemLog");
        assert!(matches!(
            reader.receive::<SupervisorMessage>().await,
            Err(IpcError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_send_after_writer_gone_fails() {
        let (outbox, rx) = Outbox::<SupervisorMessage>::channel();
        drop(rx);
        assert!(outbox.is_closed());
        assert!(matches!(
            outbox.send(SupervisorMessage::ready()),
            Err(IpcError::NotConnected)
        ));
    }
}
