//! Dedicated writer task per connection.
//!
//! Handler tasks, the client and the balancer never touch the socket's write
//! half. They send fully encoded frames over an mpsc channel to a single
//! writer task, which coalesces whatever is queued into one write.
//!
//! ```text
//! Handler 1 ─┐
//! Handler 2 ─┼─► mpsc::Sender<Bytes> ─► Writer Task ─► TcpStream
//! Handler N ─┘
//! ```
//!
//! When the socket fails the task exits and drops the receiver; every later
//! [`WriterHandle::send`] returns [`RpcError::ConnectionClosed`].

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, RpcError};

/// Default channel capacity (frames queued per connection).
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames coalesced into a single write.
const MAX_BATCH_SIZE: usize = 64;

/// Handle for sending frames to the writer task.
///
/// Cheap to clone; one clone per in-flight call is normal.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
}

impl WriterHandle {
    /// Queue an encoded frame. Waits while the channel is full.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task for `writer`.
///
/// The task ends cleanly when every [`WriterHandle`] is dropped, or with an
/// error when a write fails.
pub fn spawn_writer_task<W>(writer: W, channel_capacity: usize) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(channel_capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = BytesMut::new();

    while let Some(first) = rx.recv().await {
        let mut count = 1;
        match rx.try_recv() {
            Err(_) => {
                // Common case: a single frame, write it without copying.
                writer.write_all(&first).await?;
            }
            Ok(second) => {
                batch.clear();
                batch.extend_from_slice(&first);
                batch.extend_from_slice(&second);
                count += 1;
                while count < MAX_BATCH_SIZE {
                    match rx.try_recv() {
                        Ok(frame) => {
                            batch.extend_from_slice(&frame);
                            count += 1;
                        }
                        Err(_) => break,
                    }
                }
                writer.write_all(&batch).await?;
            }
        }
        writer.flush().await?;
        tracing::trace!(frames = count, "flushed frames");
    }

    Ok(())
}
