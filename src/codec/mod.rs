//! Wire format for the frames exchanged between a client and the event log server.
//!
//! Every frame is sent as a big-endian `u32` with the length of its body, followed by the body.
//!  The body starts with a single byte identifying the [FrameKind], followed by the kind-specific
//!  fields:
//!
//! ```ascii
//! 0: body length (u32 BE), not counting these four bytes
//! 4: frame kind (u8)
//! 5: fields
//! ```
//!
//! Fixed-width integers are big-endian. Strings are a varint length followed by UTF-8 bytes.
//!  Optional fields are preceded by a presence byte (0 or 1). Payload documents (events,
//!  matchers, query results) are a varint length followed by the document's JSON text.

use std::fmt::Debug;

use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::codec::server_frames::{QueryResponseData, QueryResultData, RecevData, ResponseData, ServerFrame, SubResponseData};

pub mod client_frames;
pub mod frame_decoder;
pub mod server_frames;

pub const FRAME_LEN_PREFIX_SIZE: usize = std::mem::size_of::<u32>();


#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum FrameKind {
    // client to server
    Connect = 1,
    Subscribe = 2,
    Unsubscribe = 3,
    Emit = 4,
    Query = 5,
    QueryAck = 6,
    AckEv = 7,

    // server to client
    ConnectResponse = 0x41,
    Response = 0x42,
    SubResponse = 0x43,
    QueryResponse = 0x44,
    Recev = 0x45,
    QueryResult = 0x46,
    Ping = 0x47,
}

/// A frame that knows how to write and parse its own body, i.e. everything after the length
///  prefix, starting with the [FrameKind] byte.
pub trait WireFrame: Debug + Sized {
    fn kind(&self) -> FrameKind;

    fn ser(&self, buf: &mut BytesMut);

    fn deser(buf: &[u8]) -> anyhow::Result<Self>;
}

/// Serialize a frame including its length prefix, ready to be handed to a transport.
///
/// Fails if the body is longer than `max_body_len`, or longer than the length prefix can
///  represent.
pub fn encode(frame: &impl WireFrame, max_body_len: usize) -> anyhow::Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u32(0);
    frame.ser(&mut buf);

    let body_len = buf.len() - FRAME_LEN_PREFIX_SIZE;
    if body_len > max_body_len {
        return Err(anyhow!("{:?} frame of {} bytes exceeds the maximum of {}", frame.kind(), body_len, max_body_len));
    }
    let body_len = u32::try_from(body_len)
        .map_err(|_| anyhow!("{:?} frame of {} bytes does not fit a length prefix", frame.kind(), body_len))?;

    buf[..FRAME_LEN_PREFIX_SIZE].copy_from_slice(&body_len.to_be_bytes());
    Ok(buf.freeze())
}


/// Typed callbacks for frames received from the server, one per inbound [FrameKind].
///
/// An `Err` result signals that the frame is inconsistent with the client's protocol state, and
///  the receiving side is expected to treat that as fatal for the connection.
#[cfg_attr(test, automock)]
pub trait ServerFrameHandler: Send + Sync {
    fn on_connect_response(&self, data: ResponseData) -> anyhow::Result<()>;
    fn on_response(&self, data: ResponseData) -> anyhow::Result<()>;
    fn on_sub_response(&self, data: SubResponseData) -> anyhow::Result<()>;
    fn on_query_response(&self, data: QueryResponseData) -> anyhow::Result<()>;
    fn on_recev(&self, data: RecevData) -> anyhow::Result<()>;
    fn on_query_result(&self, data: QueryResultData) -> anyhow::Result<()>;
    fn on_ping(&self) -> anyhow::Result<()>;
}

pub fn dispatch(frame: ServerFrame, handler: &dyn ServerFrameHandler) -> anyhow::Result<()> {
    match frame {
        ServerFrame::ConnectResponse(data) => handler.on_connect_response(data),
        ServerFrame::Response(data) => handler.on_response(data),
        ServerFrame::SubResponse(data) => handler.on_sub_response(data),
        ServerFrame::QueryResponse(data) => handler.on_query_response(data),
        ServerFrame::Recev(data) => handler.on_recev(data),
        ServerFrame::QueryResult(data) => handler.on_query_result(data),
        ServerFrame::Ping => handler.on_ping(),
    }
}

#[cfg(test)]
mod test {
    use anyhow::anyhow;
    use rstest::rstest;
    use serde_json::json;

    use crate::codec::client_frames::{ClientFrame, QueryAckData};

    use super::*;

    #[test]
    fn test_encode_prefixes_body_len() {
        let encoded = encode(&ClientFrame::QueryAck(QueryAckData { query_id: 0x01020304 }), usize::MAX).unwrap();
        assert_eq!(encoded.as_ref(), &[0,0,0,5, 6, 1,2,3,4]);
    }

    #[rstest]
    #[case::below(6, true)]
    #[case::exact(5, true)]
    #[case::above(4, false)]
    fn test_encode_max_body_len(#[case] max_body_len: usize, #[case] expected_ok: bool) {
        let encoded = encode(&ClientFrame::QueryAck(QueryAckData { query_id: 1 }), max_body_len);
        assert_eq!(encoded.is_ok(), expected_ok);
    }

    #[rstest]
    #[case::connect(0x41, Some(FrameKind::ConnectResponse))]
    #[case::ping(0x47, Some(FrameKind::Ping))]
    #[case::ack_ev(7, Some(FrameKind::AckEv))]
    #[case::unknown(0x40, None)]
    #[case::zero(0, None)]
    fn test_frame_kind_from_u8(#[case] raw: u8, #[case] expected: Option<FrameKind>) {
        assert_eq!(FrameKind::try_from(raw).ok(), expected);
    }

    #[test]
    fn test_dispatch_recev() {
        let data = RecevData {
            sub_id: 3,
            channel: "orders".to_string(),
            timestamp: 1234,
            sequence_number: 17,
            event: json!({"x": 1}),
            size_bytes: 29,
        };

        let mut handler = MockServerFrameHandler::new();
        handler.expect_on_recev()
            .once()
            .withf(|d| d.sub_id == 3 && d.sequence_number == 17)
            .returning(|_| Ok(()));

        dispatch(ServerFrame::Recev(data), &handler).unwrap();
    }

    #[test]
    fn test_dispatch_routes_response_kinds_separately() {
        let mut handler = MockServerFrameHandler::new();
        handler.expect_on_connect_response()
            .once()
            .returning(|_| Ok(()));
        handler.expect_on_response()
            .once()
            .returning(|_| Ok(()));
        handler.expect_on_sub_response()
            .once()
            .withf(|d| d.sub_id == 9)
            .returning(|_| Ok(()));
        handler.expect_on_query_response()
            .once()
            .withf(|d| d.query_id == 4 && d.num_results == 1)
            .returning(|_| Ok(()));
        handler.expect_on_ping()
            .once()
            .returning(|| Ok(()));

        dispatch(ServerFrame::ConnectResponse(ResponseData::ok()), &handler).unwrap();
        dispatch(ServerFrame::Response(ResponseData::ok()), &handler).unwrap();
        dispatch(ServerFrame::SubResponse(SubResponseData { response: ResponseData::ok(), sub_id: 9 }), &handler).unwrap();
        dispatch(ServerFrame::QueryResponse(QueryResponseData { response: ResponseData::ok(), query_id: 4, num_results: 1 }), &handler).unwrap();
        dispatch(ServerFrame::Ping, &handler).unwrap();
    }

    #[test]
    fn test_dispatch_propagates_handler_error() {
        let mut handler = MockServerFrameHandler::new();
        handler.expect_on_query_result()
            .once()
            .returning(|_| Err(anyhow!("unexpected query result")));

        let result = dispatch(ServerFrame::QueryResult(QueryResultData { query_id: 1, result: json!(null) }), &handler);
        assert!(result.is_err());
    }
}
