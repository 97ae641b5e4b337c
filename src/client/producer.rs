use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::debug;

use crate::client::client_error::ClientError;
use crate::client::connection::ConnectionInner;
use crate::client::pending::Pending;

/// the session ID for events emitted without a producer
pub const ANONYMOUS_SESSION_ID: i32 = -1;

pub(crate) struct ProducerShared {
    pub(crate) session_id: i32,
    pub(crate) channel: String,
    pub(crate) conn: Weak<ConnectionInner>,
}

/// Emits events to a single channel under its own session ID. Creating a producer is a local
///  operation, the server learns about the session with the first emitted event.
#[derive(Clone)]
pub struct Producer {
    shared: Arc<ProducerShared>,
}

impl Producer {
    pub(crate) fn new(shared: Arc<ProducerShared>) -> Producer {
        Producer { shared }
    }

    pub fn session_id(&self) -> i32 {
        self.shared.session_id
    }

    pub fn channel(&self) -> &str {
        &self.shared.channel
    }

    pub fn emit(&self, event: Value) -> Pending<()> {
        let Some(conn) = self.shared.conn.upgrade() else {
            return Pending::failed(ClientError::ConnectionClosed);
        };
        if !conn.is_closed() && conn.producers.get(self.shared.session_id).is_none() {
            return Pending::failed(ClientError::InvalidArgument(format!("producer {} is closed", self.shared.session_id)));
        }
        conn.emit(&self.shared.channel, self.shared.session_id, event)
    }

    /// Removes the producer from its connection, after which emitting through it fails. Events
    ///  emitted before are not affected.
    pub fn close(&self) {
        if let Some(conn) = self.shared.conn.upgrade() {
            if conn.producers.remove(self.shared.session_id).is_some() {
                debug!(session_id = self.shared.session_id, channel = %self.shared.channel, "producer closed");
            }
        }
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("session_id", &self.shared.session_id)
            .field("channel", &self.shared.channel)
            .finish()
    }
}
