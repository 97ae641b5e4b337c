use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::client::client_config::ClientConfig;
use crate::transport::{Transport, TransportEvent};

const EVENT_QUEUE_DEPTH: usize = 1024;

/// [Transport] over a TCP connection.
///
/// Submitted buffers go into an unbounded queue that a writer task drains, so submitting never
///  blocks the caller. A reader task forwards received bytes as [TransportEvent]s.
///
/// Closing gives the writer up to [ClientConfig::close_flush_timeout] to write what was
///  submitted, e.g. when the peer stopped reading, and aborts it after that.
pub struct TcpTransport {
    peer_addr: SocketAddr,
    close_flush_timeout: Duration,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub async fn connect(addr: impl ToSocketAddrs, config: &ClientConfig) -> anyhow::Result<(TcpTransport, mpsc::Receiver<TransportEvent>)> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        TcpTransport::from_stream(stream, config)
    }

    pub fn from_stream(stream: TcpStream, config: &ClientConfig) -> anyhow::Result<(TcpTransport, mpsc::Receiver<TransportEvent>)> {
        let peer_addr = stream.peer_addr()?;
        debug!(%peer_addr, "TCP connection established");

        let (read_half, write_half) = stream.into_split();
        let (event_send, event_recv) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (outbound_send, outbound_recv) = mpsc::unbounded_channel();

        let writer_task = tokio::spawn(Self::run_writer(write_half, outbound_recv, event_send.clone()));
        let reader_task = tokio::spawn(Self::run_reader(read_half, config.read_buffer_size, event_send));

        Ok((TcpTransport {
            peer_addr,
            close_flush_timeout: config.close_flush_timeout,
            outbound: Mutex::new(Some(outbound_send)),
            writer_task: Mutex::new(Some(writer_task)),
            reader_task: Mutex::new(Some(reader_task)),
        }, event_recv))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    async fn run_reader(mut read_half: OwnedReadHalf, buffer_size: usize, events: mpsc::Sender<TransportEvent>) {
        let mut buf = BytesMut::with_capacity(buffer_size);
        loop {
            buf.reserve(buffer_size);
            match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!("connection closed by peer");
                    break;
                }
                Ok(n) => {
                    trace!(n, "received bytes");
                    if events.send(TransportEvent::Data(buf.split().freeze())).await.is_err() {
                        // nobody is listening any more
                        return;
                    }
                }
                Err(e) => {
                    error!(error = ?e, "error reading from TCP connection");
                    break;
                }
            }
        }
        let _ = events.send(TransportEvent::Closed).await;
    }

    async fn run_writer(mut write_half: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Bytes>, events: mpsc::Sender<TransportEvent>) {
        while let Some(buf) = outbound.recv().await {
            if let Err(e) = write_half.write_all(&buf).await {
                error!(error = ?e, "error writing to TCP connection");
                let _ = events.send(TransportEvent::Closed).await;
                return;
            }
        }

        trace!("outbound queue closed, shutting down write side");
        if let Err(e) = write_half.shutdown().await {
            warn!(error = ?e, "error shutting down TCP connection");
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn submit(&self, buf: Bytes) -> anyhow::Result<()> {
        match self.outbound.lock().as_ref() {
            Some(outbound) => outbound.send(buf)
                .map_err(|_| anyhow!("TCP writer for {} terminated", self.peer_addr)),
            None => Err(anyhow!("TCP transport to {} is closed", self.peer_addr)),
        }
    }

    async fn close(&self) {
        // dropping the sender lets the writer flush what was submitted, and then terminate
        let was_open = self.outbound.lock().take().is_some();
        if was_open {
            debug!(peer_addr = %self.peer_addr, "closing TCP transport");
        }

        let writer_task = self.writer_task.lock().take();
        if let Some(mut writer_task) = writer_task {
            if tokio::time::timeout(self.close_flush_timeout, &mut writer_task).await.is_err() {
                warn!(peer_addr = %self.peer_addr, "flushing on close timed out, discarding unsent data");
                writer_task.abort();
            }
        }

        if let Some(reader_task) = self.reader_task.lock().take() {
            reader_task.abort();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(reader_task) = self.reader_task.get_mut().take() {
            reader_task.abort();
        }
        if let Some(writer_task) = self.writer_task.get_mut().take() {
            writer_task.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (transport, mut events) = TcpTransport::connect(addr, &ClientConfig::new()).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        transport.submit(Bytes::from_static(b"abc")).unwrap();
        transport.submit(Bytes::from_static(b"def")).unwrap();

        let mut received = [0u8; 6];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"abcdef");

        server.write_all(b"xyz").await.unwrap();
        let mut data = Vec::new();
        while data.len() < 3 {
            match events.recv().await.unwrap() {
                TransportEvent::Data(d) => data.extend_from_slice(&d),
                TransportEvent::Closed => panic!("closed prematurely"),
            }
        }
        assert_eq!(data, b"xyz");

        drop(server);
        assert_eq!(events.recv().await, Some(TransportEvent::Closed));

        transport.close().await;
        assert!(transport.submit(Bytes::from_static(b"late")).is_err());
        transport.close().await;
    }

    #[tokio::test]
    async fn test_close_flushes_submitted_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (transport, _events) = TcpTransport::connect(addr, &ClientConfig::new()).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        transport.submit(Bytes::from_static(b"last words")).unwrap();
        transport.close().await;

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last words");
    }

    #[tokio::test]
    async fn test_close_with_peer_not_reading() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = ClientConfig {
            close_flush_timeout: Duration::from_millis(200),
            ..ClientConfig::new()
        };
        let (transport, _events) = TcpTransport::connect(addr, &config).await.unwrap();
        // accepted, but never read from
        let (_server, _) = listener.accept().await.unwrap();

        let chunk = Bytes::from(vec![0u8; 1024 * 1024]);
        for _ in 0..64 {
            transport.submit(chunk.clone()).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), transport.close()).await
            .expect("close must not wait for a peer that does not read");
        assert!(transport.submit(Bytes::from_static(b"late")).is_err());
    }
}
