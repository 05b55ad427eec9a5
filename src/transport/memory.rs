//! In-memory transport over `tokio::io::duplex`.
//!
//! Each `connect()` creates a fresh duplex pair and hands the far end to the
//! paired [`MemoryPeer`], which plays the head unit. Dropping the peer's
//! stream is seen by the connection as a transport loss.
//!
//! # Example
//!
//! ```
//! use sdl_proxy::transport::{MemoryTransport, Transport};
//!
//! # tokio_test_block_on(async {
//! let (transport, mut peer) = MemoryTransport::new(4096);
//! let _link = transport.connect().await.unwrap();
//! assert!(peer.accept().await.is_some());
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;

use super::{Transport, TransportLink};
use crate::error::{ProxyError, Result};

struct Inner {
    buffer: usize,
    peers: mpsc::UnboundedSender<DuplexStream>,
    refuse: AtomicBool,
    connects: AtomicUsize,
    max_frame_size: Option<usize>,
}

/// Transport whose far end lives in the same process.
///
/// Cheap to clone; clones share the same peer and switches.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    /// Create a transport with the given duplex buffer size.
    pub fn new(buffer: usize) -> (Self, MemoryPeer) {
        Self::with_max_frame_size(buffer, None)
    }

    pub fn with_max_frame_size(buffer: usize, max_frame_size: Option<usize>) -> (Self, MemoryPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(Inner {
                buffer,
                peers: tx,
                refuse: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                max_frame_size,
            }),
        };
        (transport, MemoryPeer { incoming: rx })
    }

    /// Make subsequent `connect()` calls fail, as if the head unit vanished.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::Release);
    }

    /// Number of connect attempts so far, refused ones included.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<TransportLink> {
        self.inner.connects.fetch_add(1, Ordering::AcqRel);
        if self.inner.refuse.load(Ordering::Acquire) {
            return Err(ProxyError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "memory transport refusing connections",
            )));
        }

        let (local, remote) = duplex(self.inner.buffer);
        self.inner.peers.send(remote).map_err(|_| {
            ProxyError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "memory peer dropped",
            ))
        })?;

        let (reader, writer) = tokio::io::split(local);
        Ok(TransportLink::new(reader, writer))
    }

    fn max_frame_size(&self) -> Option<usize> {
        self.inner.max_frame_size
    }
}

/// Far end of a [`MemoryTransport`].
pub struct MemoryPeer {
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
}

impl MemoryPeer {
    /// Wait for the next link the connection opens.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.incoming.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (transport, mut peer) = MemoryTransport::new(1024);
        let mut link = transport.connect().await.unwrap();
        let mut remote = peer.accept().await.unwrap();

        link.writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong").await.unwrap();
        link.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_peer_drop_reads_eof() {
        let (transport, mut peer) = MemoryTransport::new(1024);
        let mut link = transport.connect().await.unwrap();
        drop(peer.accept().await.unwrap());

        let mut buf = [0u8; 8];
        assert_eq!(link.reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refuse_connections() {
        let (transport, _peer) = MemoryTransport::new(1024);
        transport.refuse_connections(true);
        assert!(matches!(transport.connect().await, Err(ProxyError::Io(_))));
        assert_eq!(transport.connect_count(), 1);

        transport.refuse_connections(false);
        assert!(transport.connect().await.is_ok());
    }
}
