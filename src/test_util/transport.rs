use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::client::client_config::ClientConfig;
use crate::client::connection::Connection;
use crate::codec::client_frames::ClientFrame;
use crate::codec::server_frames::{ResponseData, ServerFrame};
use crate::codec::{encode, WireFrame, FRAME_LEN_PREFIX_SIZE};
use crate::transport::{Transport, TransportEvent};

const EXPECT_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// An in-memory [Transport] that records every submitted buffer
#[derive(Default)]
pub struct TrackingMockTransport {
    sent: Mutex<VecDeque<Bytes>>,
    sent_notify: Notify,
    closed: AtomicBool,
}

impl TrackingMockTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for TrackingMockTransport {
    fn submit(&self, buf: Bytes) -> anyhow::Result<()> {
        if self.is_closed() {
            return Err(anyhow!("mock transport is closed"));
        }
        self.sent.lock().push_back(buf);
        self.sent_notify.notify_one();
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// The server side of a [TrackingMockTransport]: decodes what the client sent, and injects
///  frames or a disconnect into the client's receiving side
pub struct MockServer {
    transport: Arc<TrackingMockTransport>,
    events: mpsc::Sender<TransportEvent>,
}

impl MockServer {
    /// returns all frames sent so far, clearing the internal buffer
    pub fn sent_frames(&self) -> Vec<ClientFrame> {
        let sent = std::mem::take(&mut *self.transport.sent.lock());
        sent.iter()
            .map(|buf| Self::decode(buf))
            .collect()
    }

    /// Waits for the next frame sent by the client, panicking if there is none within a couple
    ///  of seconds
    pub async fn expect_frame(&self) -> ClientFrame {
        let wait = async {
            loop {
                if let Some(buf) = self.transport.sent.lock().pop_front() {
                    return Self::decode(&buf);
                }
                self.transport.sent_notify.notified().await;
            }
        };

        match tokio::time::timeout(EXPECT_FRAME_TIMEOUT, wait).await {
            Ok(frame) => frame,
            Err(_) => panic!("client sent no frame within {:?}", EXPECT_FRAME_TIMEOUT),
        }
    }

    pub fn assert_nothing_sent(&self) {
        let sent = self.sent_frames();
        assert!(sent.is_empty(), "unexpected frames sent: {:?}", sent);
    }

    pub async fn send(&self, frame: ServerFrame) {
        match encode(&frame, usize::MAX) {
            Ok(data) => self.send_raw(data).await,
            Err(e) => panic!("cannot encode {:?}: {}", frame, e),
        }
    }

    /// sends bytes as they are, which need not be a valid frame
    pub async fn send_raw(&self, data: Bytes) {
        if self.events.send(TransportEvent::Data(data)).await.is_err() {
            panic!("client stopped receiving");
        }
    }

    pub async fn disconnect(&self) {
        let _ = self.events.send(TransportEvent::Closed).await;
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    fn decode(buf: &Bytes) -> ClientFrame {
        assert!(buf.len() >= FRAME_LEN_PREFIX_SIZE, "buffer too short for a frame: {:?}", buf);
        let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(body_len, buf.len() - FRAME_LEN_PREFIX_SIZE, "a submitted buffer must be exactly one frame");

        match ClientFrame::deser(&buf[FRAME_LEN_PREFIX_SIZE..]) {
            Ok(frame) => frame,
            Err(e) => panic!("client sent an undecodable frame: {}", e),
        }
    }
}

pub fn mock_transport() -> (Arc<TrackingMockTransport>, mpsc::Receiver<TransportEvent>, MockServer) {
    let transport = Arc::new(TrackingMockTransport::default());
    let (send, recv) = mpsc::channel(128);
    let server = MockServer {
        transport: transport.clone(),
        events: send,
    };
    (transport, recv, server)
}

/// Creates a [Connection] over a mock transport, with the handshake already done
pub async fn connected_pair(config: ClientConfig) -> (Connection, MockServer) {
    let (transport, events, server) = mock_transport();
    let connecting = tokio::spawn(Connection::connect(transport, events, Arc::new(config)));

    match server.expect_frame().await {
        ClientFrame::Connect(_) => {}
        other => panic!("expected CONNECT, was {:?}", other),
    }
    server.send(ServerFrame::ConnectResponse(ResponseData::ok())).await;

    match connecting.await {
        Ok(Ok(connection)) => (connection, server),
        Ok(Err(e)) => panic!("connect failed: {}", e),
        Err(e) => panic!("connect task failed: {}", e),
    }
}
