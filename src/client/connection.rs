use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::ToSocketAddrs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::client::client_config::ClientConfig;
use crate::client::client_error::{ClientError, ProtocolViolation};
use crate::client::pending::{Completer, Pending};
use crate::client::producer::{Producer, ProducerShared, ANONYMOUS_SESSION_ID};
use crate::client::query_correlator::{PendingQuery, QueryCorrelator};
use crate::client::registry::{Registry, RegistryError};
use crate::client::response_correlator::{handler_for, unexpected_reply, Reply, ResponseCorrelator, ResponseHandler};
use crate::client::subscription::{EventHandler, SubDescriptor, Subscription, SubscriptionShared};
use crate::codec;
use crate::codec::client_frames::{ClientFrame, ConnectData, EmitData, QueryAckData, QueryData};
use crate::codec::frame_decoder::FrameDecoder;
use crate::codec::server_frames::{QueryResponseData, QueryResultData, RecevData, ResponseData, ServerFrame, SubResponseData};
use crate::codec::{ServerFrameHandler, WireFrame};
use crate::transport::tcp::TcpTransport;
use crate::transport::{Transport, TransportEvent};

/// A client connection to the event log server, multiplexing producers, subscriptions and
///  queries over a single transport.
///
/// This is a cheap handle that can be cloned and shared between tasks. The connection stays open
///  until [Connection::close] is called or the server goes away; dropping handles does not close
///  it.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    closed: AtomicBool,
    session_seq: AtomicI32,
    query_seq: AtomicU32,
    responses: ResponseCorrelator,
    queries: QueryCorrelator,
    pub(crate) subscriptions: Registry<u32, Arc<SubscriptionShared>>,
    pub(crate) producers: Registry<i32, Arc<ProducerShared>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Performs the CONNECT handshake over a transport, with `events` being the transport's
    ///  receiving side. If the handshake fails, the transport is closed.
    pub async fn connect(transport: Arc<dyn Transport>, events: mpsc::Receiver<TransportEvent>, config: Arc<ClientConfig>) -> Result<Connection, ClientError> {
        let inner = Arc::new(ConnectionInner {
            config,
            transport,
            closed: AtomicBool::new(false),
            session_seq: AtomicI32::new(0),
            query_seq: AtomicU32::new(0),
            responses: ResponseCorrelator::new(),
            queries: QueryCorrelator::new(),
            subscriptions: Registry::new(),
            producers: Registry::new(),
            dispatch_task: Mutex::new(None),
        });

        let dispatch_task = tokio::spawn(inner.clone().dispatch_loop(events));
        *inner.dispatch_task.lock() = Some(dispatch_task);
        let connection = Connection { inner };

        let version = connection.inner.config.protocol_version.clone();
        debug!(%version, "sending CONNECT");
        let handshake: Pending<()> = connection.inner.request(ClientFrame::Connect(ConnectData { version }), |completer| {
            handler_for(completer, |reply| match reply {
                Reply::Connect(data) => Ok(data.into_result()),
                other => Err(unexpected_reply("CONNECT", &other)),
            })
        });

        match handshake.await {
            Ok(()) => {
                info!("connected");
                Ok(connection)
            }
            Err(e) => {
                warn!(error = %e, "connect handshake failed");
                connection.close().await;
                Err(e)
            }
        }
    }

    pub async fn connect_tcp(addr: impl ToSocketAddrs, config: Arc<ClientConfig>) -> Result<Connection, ClientError> {
        let (transport, events) = TcpTransport::connect(addr, &config).await?;
        Connection::connect(Arc::new(transport), events, config).await
    }

    /// Creates a producer for a channel. This is a purely local operation.
    pub fn create_producer(&self, channel: impl Into<String>) -> Result<Producer, ClientError> {
        let channel = channel.into();
        if channel.is_empty() {
            return Err(ClientError::InvalidArgument("a producer requires a channel".to_string()));
        }
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }

        loop {
            let session_id = self.inner.session_seq.fetch_add(1, Ordering::Relaxed);
            if session_id == ANONYMOUS_SESSION_ID {
                continue;
            }

            let shared = Arc::new(ProducerShared {
                session_id,
                channel: channel.clone(),
                conn: Arc::downgrade(&self.inner),
            });
            match self.inner.producers.insert(session_id, shared.clone()) {
                Ok(()) => {
                    debug!(session_id, %channel, "created producer");
                    return Ok(Producer::new(shared));
                }
                Err(RegistryError::Closed) => return Err(ClientError::ConnectionClosed),
                // the counter wrapped around and hit a live producer
                Err(RegistryError::Duplicate(_)) => continue,
            }
        }
    }

    /// Subscribes to a channel. `handler` is called for every event delivered to the
    ///  subscription, on the connection's dispatch task.
    pub fn subscribe(&self, descriptor: SubDescriptor, handler: EventHandler) -> Pending<Subscription> {
        let frame = match descriptor.to_frame() {
            Ok(frame) => frame,
            Err(e) => return Pending::failed(e),
        };

        let conn = Arc::downgrade(&self.inner);
        let warn_threshold = self.inner.config.unacked_bytes_warn_threshold;
        let channel = descriptor.channel;

        self.inner.request(frame, move |completer| -> ResponseHandler {
            Box::new(move |reply: Result<Reply, ClientError>| {
                let data = match reply {
                    Ok(Reply::Subscribe(data)) => data,
                    Ok(other) => {
                        let violation = unexpected_reply("SUBSCRIBE", &other);
                        let _ = completer.send(Err(violation.clone().into()));
                        return Err(violation);
                    }
                    Err(e) => {
                        let _ = completer.send(Err(e));
                        return Ok(());
                    }
                };

                if let Err(e) = data.response.into_result() {
                    debug!(%channel, error = %e, "subscription rejected");
                    let _ = completer.send(Err(e));
                    return Ok(());
                }

                let Some(inner) = conn.upgrade() else {
                    let _ = completer.send(Err(ClientError::ConnectionClosed));
                    return Ok(());
                };

                let sub_id = data.sub_id;
                let shared = Arc::new(SubscriptionShared::new(sub_id, channel, handler, warn_threshold, conn));
                match inner.subscriptions.insert(sub_id, shared.clone()) {
                    Ok(()) => {}
                    Err(RegistryError::Closed) => {
                        let _ = completer.send(Err(ClientError::ConnectionClosed));
                        return Ok(());
                    }
                    Err(RegistryError::Duplicate(_)) => {
                        let violation = ProtocolViolation(format!("server assigned subscription ID {} which is already in use", sub_id));
                        let _ = completer.send(Err(violation.clone().into()));
                        return Err(violation);
                    }
                }
                debug!(sub_id, "subscribed");

                if let Err(Ok(subscription)) = completer.send(Ok(Subscription::new(shared))) {
                    // the caller stopped waiting, e.g. because of a timeout
                    debug!(sub_id, "nobody is waiting for the subscription any more");
                    subscription.unsubscribe();
                }
                Ok(())
            })
        })
    }

    /// Emits an event to a channel without a producer session
    pub fn emit(&self, channel: &str, event: Value) -> Pending<()> {
        self.inner.emit(channel, ANONYMOUS_SESSION_ID, event)
    }

    /// Accepts a partition function for forward compatibility. The partition key is computed,
    ///  but partitioned routing is not supported yet and the event is emitted like with
    ///  [Connection::emit].
    pub fn emit_partitioned(&self, channel: &str, event: Value, partition_fn: impl FnOnce(&Value) -> String) -> Pending<()> {
        let partition_key = partition_fn(&event);
        debug!(channel, %partition_key, "partitioned emission is not supported, emitting unpartitioned");
        self.inner.emit(channel, ANONYMOUS_SESSION_ID, event)
    }

    /// Point lookup of the record with a given ID in a binder, completing with `None` if there is
    ///  no such record
    pub fn get_by_id(&self, binder: &str, id: impl Into<Value>) -> Pending<Option<Value>> {
        let matcher = json!({"$match": {"id": id.into()}});
        self.get_by_match(binder, matcher)
    }

    /// Point lookup by an arbitrary matcher. The matcher must match at most one record, the
    ///  server announcing more results is a protocol violation.
    pub fn get_by_match(&self, binder: &str, matcher: Value) -> Pending<Option<Value>> {
        self.inner.query(binder, matcher, PendingQuery::Single)
    }

    /// Completes with all records matching `matcher`, in the order the server sends them
    pub fn get_all_matching(&self, binder: &str, matcher: Value) -> Pending<Vec<Value>> {
        self.inner.query(binder, matcher, |completer| PendingQuery::All {
            expected: 0,
            results: Vec::new(),
            completer,
        })
    }

    /// Fails all pending operations with [ClientError::ConnectionClosed], drops all subscriptions
    ///  and producers, and closes the transport. Calling this more than once has no further
    ///  effect.
    pub async fn close(&self) {
        if self.inner.teardown() {
            info!("connection closed");
        }

        let dispatch_task = self.inner.dispatch_task.lock().take();
        if let Some(dispatch_task) = dispatch_task {
            dispatch_task.abort();
        }
        self.inner.transport.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn num_subscriptions(&self) -> usize {
        self.inner.subscriptions.len()
    }

    pub fn num_pending_requests(&self) -> usize {
        self.inner.responses.num_pending()
    }

    pub fn num_pending_queries(&self) -> usize {
        self.inner.queries.num_pending()
    }
}

impl ConnectionInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends a request that expects a response, registering its handler with the response
    ///  correlator
    fn request<T: Send + 'static>(&self, frame: ClientFrame, make_handler: impl FnOnce(Completer<T>) -> ResponseHandler) -> Pending<T> {
        if self.is_closed() {
            return Pending::failed(ClientError::ConnectionClosed);
        }

        let buf = match codec::encode(&frame, self.config.max_frame_len) {
            Ok(buf) => buf,
            Err(e) => return Pending::failed(ClientError::InvalidArgument(e.to_string())),
        };

        let deadline = self.config.request_timeout
            .map(|timeout| Instant::now() + timeout);
        let (completer, pending) = Pending::new(deadline);

        trace!(kind = ?frame.kind(), "sending request");
        self.responses.submit(self.transport.as_ref(), buf, make_handler(completer));
        pending
    }

    /// Sends a frame that has no response
    pub(crate) fn send_oneway(&self, frame: ClientFrame) {
        if self.is_closed() {
            trace!(kind = ?frame.kind(), "connection is closed, dropping frame");
            return;
        }

        trace!(kind = ?frame.kind(), "sending");
        let result = codec::encode(&frame, self.config.max_frame_len)
            .and_then(|buf| self.transport.submit(buf));
        if let Err(e) = result {
            warn!(kind = ?frame.kind(), error = %e, "error sending frame");
        }
    }

    pub(crate) fn emit(&self, channel: &str, session_id: i32, event: Value) -> Pending<()> {
        if channel.is_empty() {
            return Pending::failed(ClientError::InvalidArgument("emitting requires a channel".to_string()));
        }

        trace!(channel, session_id, "emitting event");
        let frame = ClientFrame::Emit(EmitData {
            channel: channel.to_string(),
            session_id,
            event,
        });
        self.request(frame, |completer| {
            handler_for(completer, |reply| match reply {
                Reply::Generic(data) => Ok(data.into_result()),
                other => Err(unexpected_reply("EMIT", &other)),
            })
        })
    }

    /// Two-phase query: the QUERY request is answered through the response correlator with the
    ///  number of results, and the results themselves arrive as separate QUERYRESULT frames.
    fn query<T: Send + 'static>(self: &Arc<Self>, binder: &str, matcher: Value, make_query: impl FnOnce(Completer<T>) -> PendingQuery) -> Pending<T> {
        if binder.is_empty() {
            return Pending::failed(ClientError::InvalidArgument("a query requires a binder".to_string()));
        }

        let query_id = self.allocate_query_id();
        let conn = Arc::downgrade(self);
        trace!(query_id, binder, "sending query");

        let frame = ClientFrame::Query(QueryData {
            query_id,
            binder: binder.to_string(),
            matcher,
        });
        self.request(frame, move |completer| -> ResponseHandler {
            let query = make_query(completer);
            Box::new(move |reply: Result<Reply, ClientError>| {
                let data = match reply {
                    Ok(Reply::Query(data)) => data,
                    Ok(other) => {
                        let violation = unexpected_reply("QUERY", &other);
                        query.fail(violation.clone().into());
                        return Err(violation);
                    }
                    Err(e) => {
                        query.fail(e);
                        return Ok(());
                    }
                };

                if let Err(e) = data.response.into_result() {
                    query.fail(e);
                    return Ok(());
                }
                if data.query_id != query_id {
                    let violation = ProtocolViolation(format!("received a response for query {} while expecting query {}", data.query_id, query_id));
                    query.fail(violation.clone().into());
                    return Err(violation);
                }

                debug!(query_id, num_results = data.num_results, "query acknowledged");
                match query.on_count(query_id, data.num_results)? {
                    None => Ok(()),
                    Some(query) => match conn.upgrade() {
                        Some(inner) => inner.queries.register(query_id, query),
                        None => {
                            query.fail(ClientError::ConnectionClosed);
                            Ok(())
                        }
                    },
                }
            })
        })
    }

    /// IDs are never reused while a query with the same ID is pending
    fn allocate_query_id(&self) -> u32 {
        loop {
            let query_id = self.query_seq.fetch_add(1, Ordering::Relaxed);
            if !self.queries.contains(query_id) {
                return query_id;
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        let mut decoder = FrameDecoder::new(self.config.max_frame_len);

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Data(data) => {
                    decoder.extend(&data);
                    if let Err(e) = self.on_data(&mut decoder) {
                        error!(error = %e, "protocol violation, closing connection");
                        break;
                    }
                }
                TransportEvent::Closed => {
                    info!("transport closed by peer");
                    break;
                }
            }

            if self.is_closed() {
                break;
            }
        }

        self.teardown();
        self.transport.close().await;
        debug!("dispatch loop terminated");
    }

    fn on_data(&self, decoder: &mut FrameDecoder) -> anyhow::Result<()> {
        while let Some(body) = decoder.next_frame()? {
            let frame = ServerFrame::deser(&body)?;
            trace!(kind = ?frame.kind(), "received frame");
            codec::dispatch(frame, self)?;
        }
        Ok(())
    }

    /// Returns `true` if this call closed the connection, `false` if it was closed before
    fn teardown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let handlers = self.responses.close();
        if !handlers.is_empty() {
            debug!("failing {} pending requests", handlers.len());
        }
        for handler in handlers {
            let _ = handler(Err(ClientError::ConnectionClosed));
        }

        self.queries.close();

        let subscriptions = self.subscriptions.close();
        let producers = self.producers.close();
        debug!(num_subscriptions = subscriptions.len(), num_producers = producers.len(), "connection torn down");
        true
    }
}

impl ServerFrameHandler for ConnectionInner {
    fn on_connect_response(&self, data: ResponseData) -> anyhow::Result<()> {
        Ok(self.responses.complete_next(Reply::Connect(data))?)
    }

    fn on_response(&self, data: ResponseData) -> anyhow::Result<()> {
        Ok(self.responses.complete_next(Reply::Generic(data))?)
    }

    fn on_sub_response(&self, data: SubResponseData) -> anyhow::Result<()> {
        Ok(self.responses.complete_next(Reply::Subscribe(data))?)
    }

    fn on_query_response(&self, data: QueryResponseData) -> anyhow::Result<()> {
        Ok(self.responses.complete_next(Reply::Query(data))?)
    }

    fn on_recev(&self, data: RecevData) -> anyhow::Result<()> {
        match self.subscriptions.get(data.sub_id) {
            Some(subscription) => subscription.deliver(data),
            None => trace!(sub_id = data.sub_id, sequence_number = data.sequence_number, "dropping event for unknown subscription"),
        }
        Ok(())
    }

    fn on_query_result(&self, data: QueryResultData) -> anyhow::Result<()> {
        let query_id = data.query_id;
        self.queries.on_result(query_id, data.result)?;
        self.send_oneway(ClientFrame::QueryAck(QueryAckData { query_id }));
        Ok(())
    }

    fn on_ping(&self) -> anyhow::Result<()> {
        trace!("ping");
        Ok(())
    }
}
