use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

pub mod tcp;

/// Notifications from a transport's receiving side
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// bytes received from the peer, in the order they arrived but with arbitrary chunking
    Data(Bytes),
    /// The connection was closed, either by the peer or because of an I/O error. This is the last
    ///  event a transport sends.
    Closed,
}

/// A duplex byte stream to the server.
///
/// The receiving side is an `mpsc::Receiver<TransportEvent>` handed out when the transport is
///  created, so that exactly one consumer reads from it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Hand a buffer to the transport for sending. This must not block: implementations queue the
    ///  buffer and write it asynchronously, preserving submission order.
    fn submit(&self, buf: Bytes) -> anyhow::Result<()>;

    /// Flush queued buffers if possible and release the underlying connection. Closing more than
    ///  once is a no-op.
    async fn close(&self);
}
