use std::fmt::{Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::client::client_error::ClientError;
use crate::client::connection::ConnectionInner;
use crate::codec::client_frames::{AckEvData, ClientFrame, SubscribeData, UnsubscribeData};
use crate::codec::server_frames::RecevData;

/// What to subscribe to: a channel, optionally starting at a position or point in time, and
///  optionally filtered by a matcher document.
#[derive(Debug, Clone, PartialEq)]
pub struct SubDescriptor {
    pub channel: String,
    pub start_pos: Option<u64>,
    /// milliseconds since the epoch
    pub start_timestamp: Option<u64>,
    /// makes the subscription's position survive reconnects on the server side
    pub durable_id: Option<String>,
    pub matcher: Option<Value>,
}

impl SubDescriptor {
    pub fn new(channel: impl Into<String>) -> SubDescriptor {
        SubDescriptor {
            channel: channel.into(),
            start_pos: None,
            start_timestamp: None,
            durable_id: None,
            matcher: None,
        }
    }

    pub fn with_start_pos(mut self, start_pos: u64) -> SubDescriptor {
        self.start_pos = Some(start_pos);
        self
    }

    pub fn with_start_timestamp(mut self, start_timestamp: u64) -> SubDescriptor {
        self.start_timestamp = Some(start_timestamp);
        self
    }

    pub fn with_durable_id(mut self, durable_id: impl Into<String>) -> SubDescriptor {
        self.durable_id = Some(durable_id.into());
        self
    }

    pub fn with_matcher(mut self, matcher: Value) -> SubDescriptor {
        self.matcher = Some(matcher);
        self
    }

    pub(crate) fn to_frame(&self) -> Result<ClientFrame, ClientError> {
        if self.channel.is_empty() {
            return Err(ClientError::InvalidArgument("a subscription requires a channel".to_string()));
        }

        Ok(ClientFrame::Subscribe(SubscribeData {
            channel: self.channel.clone(),
            start_pos: self.start_pos,
            start_timestamp: self.start_timestamp,
            durable_id: self.durable_id.clone(),
            matcher: self.matcher.clone(),
        }))
    }
}

/// Called on the connection's dispatch task for every event delivered to a subscription. It
///  should hand off work rather than block.
pub type EventHandler = Arc<dyn Fn(ReceivedEvent) + Send + Sync>;

pub(crate) struct SubscriptionShared {
    id: u32,
    channel: String,
    handler: EventHandler,
    unacked_bytes: AtomicU64,
    unacked_bytes_warn_threshold: Option<u64>,
    conn: Weak<ConnectionInner>,
}

impl SubscriptionShared {
    pub(crate) fn new(id: u32, channel: String, handler: EventHandler, unacked_bytes_warn_threshold: Option<u64>, conn: Weak<ConnectionInner>) -> SubscriptionShared {
        SubscriptionShared {
            id,
            channel,
            handler,
            unacked_bytes: AtomicU64::new(0),
            unacked_bytes_warn_threshold,
            conn,
        }
    }

    pub(crate) fn deliver(self: &Arc<Self>, data: RecevData) {
        trace!(sub_id = self.id, sequence_number = data.sequence_number, size_bytes = data.size_bytes, "delivering event");

        let size = data.size_bytes as u64;
        let prev_unacked = self.unacked_bytes.fetch_add(size, Ordering::AcqRel);
        if let Some(threshold) = self.unacked_bytes_warn_threshold {
            if prev_unacked <= threshold && prev_unacked + size > threshold {
                warn!(sub_id = self.id, unacked_bytes = prev_unacked + size, "unacknowledged bytes exceed the warning threshold - is the application acknowledging events?");
            }
        }

        let event = ReceivedEvent {
            subscription: self.clone(),
            channel: data.channel,
            timestamp: data.timestamp,
            sequence_number: data.sequence_number,
            event: data.event,
            size_bytes: data.size_bytes,
        };

        // a panicking handler must not take down the dispatch task
        if catch_unwind(AssertUnwindSafe(|| (self.handler)(event))).is_err() {
            error!(sub_id = self.id, channel = %self.channel, sequence_number = data.sequence_number, "event handler panicked");
        }
    }

    fn acknowledge(&self, bytes: u32) {
        let _ = self.unacked_bytes.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(bytes as u64)));

        match self.conn.upgrade() {
            Some(conn) => conn.send_oneway(ClientFrame::AckEv(AckEvData { sub_id: self.id, bytes })),
            None => trace!(sub_id = self.id, "connection is gone, not acknowledging"),
        }
    }
}

/// A live subscription. It receives events until it is unsubscribed or its connection closes.
///
/// Dropping the handle does *not* end the subscription.
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    pub(crate) fn new(shared: Arc<SubscriptionShared>) -> Subscription {
        Subscription { shared }
    }

    /// the server-assigned ID
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn channel(&self) -> &str {
        &self.shared.channel
    }

    /// bytes delivered to this subscription and not yet acknowledged
    pub fn unacked_bytes(&self) -> u64 {
        self.shared.unacked_bytes.load(Ordering::Acquire)
    }

    /// Stops delivery immediately, and tells the server. Calling this more than once has no
    ///  further effect.
    pub fn unsubscribe(&self) {
        let Some(conn) = self.shared.conn.upgrade() else {
            return;
        };

        // removing first means that events already in flight are dropped rather than delivered
        if conn.subscriptions.remove(self.shared.id).is_some() {
            debug!(sub_id = self.shared.id, channel = %self.shared.channel, "unsubscribing");
            conn.send_oneway(ClientFrame::Unsubscribe(UnsubscribeData { sub_id: self.shared.id }));
        }
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("channel", &self.shared.channel)
            .finish()
    }
}

/// An event delivered to a [Subscription].
///
/// Every event must be acknowledged exactly once so the server can keep sending. Acknowledging
///  consumes the event.
pub struct ReceivedEvent {
    subscription: Arc<SubscriptionShared>,
    channel: String,
    timestamp: u64,
    sequence_number: u64,
    event: Value,
    size_bytes: u32,
}

impl ReceivedEvent {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event(&self) -> &Value {
        &self.event
    }

    pub fn size_bytes(&self) -> u32 {
        self.size_bytes
    }

    pub fn sub_id(&self) -> u32 {
        self.subscription.id
    }

    pub fn acknowledge(self) {
        self.subscription.acknowledge(self.size_bytes);
    }
}

impl Debug for ReceivedEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedEvent")
            .field("sub_id", &self.subscription.id)
            .field("channel", &self.channel)
            .field("timestamp", &self.timestamp)
            .field("sequence_number", &self.sequence_number)
            .field("size_bytes", &self.size_bytes)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case::minimal(SubDescriptor::new("orders"), None, None, None)]
    #[case::full(SubDescriptor::new("orders").with_start_pos(10).with_start_timestamp(20).with_durable_id("d1"), Some(10), Some(20), Some("d1"))]
    fn test_to_frame(#[case] descriptor: SubDescriptor, #[case] start_pos: Option<u64>, #[case] start_timestamp: Option<u64>, #[case] durable_id: Option<&str>) {
        match descriptor.to_frame().unwrap() {
            ClientFrame::Subscribe(data) => {
                assert_eq!(data.channel, "orders");
                assert_eq!(data.start_pos, start_pos);
                assert_eq!(data.start_timestamp, start_timestamp);
                assert_eq!(data.durable_id.as_deref(), durable_id);
                assert_eq!(data.matcher, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_to_frame_with_matcher() {
        let descriptor = SubDescriptor::new("orders").with_matcher(json!({"state": "open"}));
        match descriptor.to_frame().unwrap() {
            ClientFrame::Subscribe(data) => assert_eq!(data.matcher, Some(json!({"state": "open"}))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_channel() {
        assert!(matches!(SubDescriptor::new("").to_frame(), Err(ClientError::InvalidArgument(_))));
    }

    #[test]
    fn test_unacked_bytes_without_connection() {
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let handler: EventHandler = Arc::new(move |evt: ReceivedEvent| received_clone.lock().push(evt));

        let shared = Arc::new(SubscriptionShared::new(4, "orders".to_string(), handler, Some(10), Weak::new()));
        let subscription = Subscription::new(shared.clone());

        for (seq, size) in [(1, 7), (2, 5)] {
            shared.deliver(RecevData {
                sub_id: 4,
                channel: "orders".to_string(),
                timestamp: 100,
                sequence_number: seq,
                event: json!({"seq": seq}),
                size_bytes: size,
            });
        }
        assert_eq!(subscription.unacked_bytes(), 12);

        let events = std::mem::take(&mut *received.lock());
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].sequence_number(), 2);
        assert_eq!(events[1].event(), &json!({"seq": 2}));
        assert_eq!(events[1].sub_id(), 4);

        for evt in events {
            evt.acknowledge();
        }
        assert_eq!(subscription.unacked_bytes(), 0);

        // no connection, so nothing to do
        subscription.unsubscribe();
    }
}
