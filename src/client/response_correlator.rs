use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::client::client_error::{ClientError, ProtocolViolation};
use crate::client::pending::Completer;
use crate::codec::server_frames::{QueryResponseData, ResponseData, SubResponseData};
use crate::transport::Transport;

/// An inbound frame that answers the oldest outstanding request
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Connect(ResponseData),
    Generic(ResponseData),
    Subscribe(SubResponseData),
    Query(QueryResponseData),
}
impl Reply {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Reply::Connect(_) => "connect response",
            Reply::Generic(_) => "response",
            Reply::Subscribe(_) => "subscribe response",
            Reply::Query(_) => "query response",
        }
    }
}

/// Invoked exactly once, with the reply or with the reason there will be no reply. Returning
///  an error signals a protocol violation, i.e. the reply did not fit the request.
pub type ResponseHandler = Box<dyn FnOnce(Result<Reply, ClientError>) -> Result<(), ProtocolViolation> + Send>;

/// Matches responses to requests by order: the protocol has no request IDs, and the server
///  answers requests in the order it receives them.
///
/// The invariant that makes this work is that a request's handler is queued *before* the
///  request is handed to the transport, and that queueing and submitting happen as one step with
///  regard to concurrent requests. Transport submission does not block, so the lock for this is
///  never held across I/O.
///
/// Handlers are always called outside the lock.
pub struct ResponseCorrelator {
    state: Mutex<CorrelatorState>,
}

#[derive(Default)]
struct CorrelatorState {
    closed: bool,
    pending: VecDeque<ResponseHandler>,
}

impl ResponseCorrelator {
    pub fn new() -> ResponseCorrelator {
        ResponseCorrelator {
            state: Default::default(),
        }
    }

    pub fn submit(&self, transport: &dyn Transport, buf: Bytes, handler: ResponseHandler) {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            let _ = handler(Err(ClientError::ConnectionClosed));
            return;
        }

        state.pending.push_back(handler);
        if let Err(e) = transport.submit(buf) {
            // the lock is still held, so the last entry is the one we just pushed
            let handler = state.pending.pop_back();
            drop(state);
            if let Some(handler) = handler {
                let _ = handler(Err(ClientError::Transport(e)));
            }
        }
    }

    pub fn complete_next(&self, reply: Reply) -> Result<(), ProtocolViolation> {
        let handler = self.state.lock().pending.pop_front();
        match handler {
            Some(handler) => {
                trace!(reply = reply.kind_name(), "completing oldest pending request");
                handler(Ok(reply))
            }
            None => Err(ProtocolViolation(format!("received a {} with no request pending", reply.kind_name()))),
        }
    }

    /// Refuse further requests, and return the handlers that are still waiting for a response.
    ///  The caller is responsible for failing them.
    pub fn close(&self) -> Vec<ResponseHandler> {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending.drain(..).collect()
    }

    pub fn num_pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

/// Convenience for the common case of a request that completes a [Completer] with the outcome of
///  its reply. `on_reply` maps the reply to the caller's result, or rejects it as a protocol
///  violation which then fails the caller as well.
pub fn handler_for<T, F>(completer: Completer<T>, on_reply: F) -> ResponseHandler
where
    T: Send + 'static,
    F: FnOnce(Reply) -> Result<Result<T, ClientError>, ProtocolViolation> + Send + 'static,
{
    Box::new(move |reply: Result<Reply, ClientError>| {
        match reply.map(on_reply) {
            Err(e) => {
                let _ = completer.send(Err(e));
                Ok(())
            }
            Ok(Ok(result)) => {
                let _ = completer.send(result);
                Ok(())
            }
            Ok(Err(violation)) => {
                let _ = completer.send(Err(violation.clone().into()));
                Err(violation)
            }
        }
    })
}

pub fn unexpected_reply(request: &str, reply: &Reply) -> ProtocolViolation {
    ProtocolViolation(format!("received a {} in response to {}", reply.kind_name(), request))
}
