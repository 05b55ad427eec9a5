//! Transport adapter boundary.
//!
//! The connection never implements a physical transport. It consumes an
//! adapter that can open a byte stream to the head unit and split it into a
//! read half and a write half:
//!
//! - received bytes and remote close arrive through the read half (EOF or an
//!   I/O error is a transport-loss event)
//! - `write(bytes)` is the write half, owned by the writer task
//!
//! [`MemoryTransport`] is an in-process adapter for tests and simulations.

mod memory;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

pub use memory::{MemoryPeer, MemoryTransport};

/// Boxed read half of a transport link.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a transport link.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open byte stream to the head unit.
pub struct TransportLink {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl TransportLink {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Capability a concrete transport provides.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new link. Called once per connect and once per reconnect
    /// attempt.
    async fn connect(&self) -> Result<TransportLink>;

    /// Release adapter resources after a user-initiated disconnect.
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Largest frame the transport carries, if it imposes one.
    fn max_frame_size(&self) -> Option<usize> {
        None
    }
}
