//! Dedicated writer task for outbound frames.
//!
//! Every logical message is handed over as one `OutboundMessage` holding all
//! of its encoded frames. The writer task is the only owner of the transport
//! write half, so the frames of one message always hit the wire contiguously
//! and in order, no matter how many callers send concurrently.
//!
//! # Architecture
//!
//! ```text
//! send_request ─┐
//! send_raw     ─┼─► mpsc::Sender<OutboundMessage> ─► Writer Task ─► Transport
//! control      ─┘
//! ```
//!
//! Messages that are ready together are batched into one `write_vectored`
//! call. A pending-message counter provides backpressure.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{ProxyError, Result};

/// Default maximum pending messages before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_MESSAGES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum messages to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// All frames of one logical message, already encoded.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub frames: Vec<Bytes>,
}

impl OutboundMessage {
    pub fn new(frames: Vec<Bytes>) -> Self {
        Self { frames }
    }

    /// Message made of a single pre-encoded frame.
    #[inline]
    pub fn single(frame: Bytes) -> Self {
        Self {
            frames: vec![frame],
        }
    }

    /// Total number of bytes across all frames.
    #[inline]
    pub fn size(&self) -> usize {
        self.frames.iter().map(Bytes::len).sum()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriterConfig {
    /// Maximum pending messages before backpressure kicks in.
    pub max_pending_messages: usize,
    /// Channel capacity for the message queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    #[serde(with = "crate::config::duration_ms")]
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending messages to the writer task.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundMessage>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundMessage>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Queue a message, waiting out backpressure up to the configured timeout.
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(message).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            ProxyError::NotConnected
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_millis(1);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                return Err(ProxyError::BackpressureTimeout);
            }
            tokio::time::sleep(check_interval).await;
        }
    }

    /// Queue a message without waiting.
    ///
    /// Used from contexts that cannot await, such as replying to a heartbeat
    /// from inside the read loop's dispatch.
    pub fn try_send(&self, message: OutboundMessage) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(ProxyError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(message).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => ProxyError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => ProxyError::NotConnected,
            }
        })
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// True once the writer task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task over a transport write half.
///
/// The task ends cleanly when every handle is dropped, or with an error when
/// the transport write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: &WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_messages,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(first) = rx.recv().await else {
            let _ = writer.shutdown().await;
            return Ok(());
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(message) => batch.push(message),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let result = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(batch_size, Ordering::Release);

        if let Err(e) = result {
            tracing::warn!(error = %e, "transport write failed, writer stopping");
            return Err(e);
        }
    }
}

/// Write a batch of messages using scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundMessage]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frames: Vec<&Bytes> = batch.iter().flat_map(|m| m.frames.iter()).collect();
    let total_size: usize = frames.iter().map(|f| f.len()).sum();
    if total_size == 0 {
        return Ok(());
    }

    let mut total_written = 0;
    while total_written < total_size {
        let slices = remaining_slices(&frames, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlices for the bytes not yet written.
fn remaining_slices<'a>(frames: &[&'a Bytes], skip_bytes: usize) -> Vec<IoSlice<'a>> {
    let mut slices = Vec::with_capacity(frames.len());
    let mut offset = 0;

    for frame in frames {
        let end = offset + frame.len();
        if skip_bytes < end && !frame.is_empty() {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame[start..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn message(parts: &[&'static [u8]]) -> OutboundMessage {
        OutboundMessage::new(parts.iter().map(|p| Bytes::from_static(p)).collect())
    }

    #[test]
    fn test_message_size() {
        let msg = message(&[b"abc", b"", b"de"]);
        assert_eq!(msg.size(), 5);
        assert_eq!(OutboundMessage::single(Bytes::from_static(b"xy")).size(), 2);
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_messages, DEFAULT_MAX_PENDING_MESSAGES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, &WriterConfig::default());

        handle.send(message(&[b"head", b"tail"])).await.unwrap();

        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"headtail");
    }

    #[tokio::test]
    async fn test_messages_stay_contiguous() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task(client, &WriterConfig::default());

        let mut senders = Vec::new();
        for tag in [b'a', b'b', b'c', b'd'] {
            let handle = handle.clone();
            senders.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let frames = (0..4).map(|_| Bytes::from(vec![tag; 16])).collect();
                    handle.send(OutboundMessage::new(frames)).await.unwrap();
                }
            }));
        }
        for s in senders {
            s.await.unwrap();
        }

        let mut buf = vec![0u8; 4 * 20 * 64];
        server.read_exact(&mut buf).await.unwrap();
        for chunk in buf.chunks(64) {
            assert!(chunk.iter().all(|&b| b == chunk[0]));
        }
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let (tx, _rx) = mpsc::channel::<OutboundMessage>(10);
        let pending = Arc::new(AtomicUsize::new(100));
        let handle = WriterHandle::new(tx, pending, 100, Duration::from_secs(1));

        let result = handle.try_send(message(&[b"x"]));
        assert!(matches!(result, Err(ProxyError::BackpressureTimeout)));
        assert!(handle.is_backpressure_active());
    }

    #[tokio::test]
    async fn test_send_after_writer_gone() {
        let (tx, rx) = mpsc::channel::<OutboundMessage>(1);
        drop(rx);
        let handle = WriterHandle::new(tx, Arc::new(AtomicUsize::new(0)), 10, Duration::from_secs(1));

        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(message(&[b"x"])).await,
            Err(ProxyError::NotConnected)
        ));
        assert_eq!(handle.pending_count(), 0);
    }

    #[test]
    fn test_remaining_slices_mid_frame() {
        let a = Bytes::from_static(b"hello");
        let b = Bytes::from_static(b"world");
        let frames = vec![&a, &b];

        let slices = remaining_slices(&frames, 0);
        assert_eq!(slices.len(), 2);

        let slices = remaining_slices(&frames, 3);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"lo");

        let slices = remaining_slices(&frames, 7);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"rld");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch = vec![message(&[b"12", b"34"]), message(&[b"56"])];

        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner(), b"123456");
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, &WriterConfig::default());

        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }
}
