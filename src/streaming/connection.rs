//! Shared, close-once connection handle.
//!
//! The stream is split into read and write halves so the Sender and the
//! Receiver never contend. Closing the handle is the only cross-loop
//! cancellation: every read and write races the closed flag, so a loop parked
//! on I/O unwinds with [`LoopError::ConnectionClosed`] as soon as any holder
//! calls [`Connection::close`].

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};

use crate::error::{LoopError, Result};
use crate::streaming::protocol::{read_frame, write_frame, Message};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Connection {
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Wrap any bidirectional byte stream (TCP, TLS, in-memory duplex).
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        Self {
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            closed,
        }
    }

    /// Encode and send one framed message.
    pub async fn send<M: Message>(&self, msg: &M) -> Result<()> {
        let payload = msg.encode()?;
        if self.is_closed() {
            return Err(LoopError::ConnectionClosed);
        }
        let closed = self.closed.subscribe();

        let mut writer = self.writer.lock().await;
        let written = tokio::select! {
            biased;
            _ = wait_closed(closed) => None,
            res = write_frame(&mut *writer, &payload) => Some(res),
        };

        match written {
            Some(res) => res,
            None => {
                // close() could not take the writer while this write held it
                shutdown_writer(&mut writer).await;
                Err(LoopError::ConnectionClosed)
            }
        }
    }

    /// Receive and decode one framed message.
    pub async fn recv<M: Message>(&self) -> Result<M> {
        if self.is_closed() {
            return Err(LoopError::ConnectionClosed);
        }
        let closed = self.closed.subscribe();

        let mut reader = self.reader.lock().await;
        let payload = tokio::select! {
            biased;
            _ = wait_closed(closed) => return Err(LoopError::ConnectionClosed),
            res = read_frame(&mut *reader) => res?,
        };
        M::decode(&payload)
    }

    /// Close the connection. Returns `false` if it was already closed.
    ///
    /// Pending and future I/O on this handle fails. If no write is in flight
    /// the write half is shut down too, so the peer sees end of stream.
    pub async fn close(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }

        // A send in flight sees the flag and shuts the writer down itself
        if let Ok(mut writer) = self.writer.try_lock() {
            shutdown_writer(&mut writer).await;
        }
        true
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        wait_closed(self.closed.subscribe()).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

// The sender lives in the handle being borrowed, so this only returns once closed
async fn wait_closed(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

async fn shutdown_writer(writer: &mut BoxedWriter) {
    if let Err(e) = writer.shutdown().await {
        tracing::debug!("shutdown after close failed: {}", e);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::protocol::{Block, BlockType, TestResult};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_send_recv() {
        let (a, b) = tokio::io::duplex(4096);
        let a = Connection::new(a);
        let b = Connection::new(b);

        let block = Block::new(1, BlockType::Plain, vec![9; 100]);
        a.send(&block).await.unwrap();

        let received: Block = b.recv().await.unwrap();
        assert_eq!(received, block);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (a, _b) = tokio::io::duplex(4096);
        let conn = Arc::new(Connection::new(a));

        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.recv::<Block>().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn.close().await);
        assert!(!conn.close().await);

        let res = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read should unblock after close")
            .unwrap();
        assert!(matches!(res, Err(LoopError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_rejects_new_io_and_signals_peer() {
        let (a, mut b) = tokio::io::duplex(4096);
        let conn = Connection::new(a);
        conn.close().await;

        assert!(conn.is_closed());
        assert!(matches!(
            conn.send(&TestResult::success()).await,
            Err(LoopError::ConnectionClosed)
        ));

        // Write half was shut down: the peer reads end of stream
        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_during_parked_write_signals_peer() {
        // Pipe far smaller than the frame, so the write parks mid-frame
        let (a, mut b) = tokio::io::duplex(1024);
        let conn = Arc::new(Connection::new(a));

        let writer = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.send(&Block::new(0, BlockType::Plain, vec![7; 64 * 1024]))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn.close().await);

        let res = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("write should unblock after close")
            .unwrap();
        assert!(matches!(res, Err(LoopError::ConnectionClosed)));

        // Peer drains the partial frame and then sees end of stream
        let mut received = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(1), b.read_to_end(&mut received))
            .await
            .expect("peer should see end of stream")
            .unwrap();
        assert!(read >= 1024);
        assert!(read < 64 * 1024);
    }
}
