use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::TryFromPrimitive;
use serde_json::Value;

use crate::codec::{FrameKind, WireFrame};
use crate::util::buf::{put_opt_payload, put_opt_string, put_opt_u64, put_payload, put_string, try_get_opt_payload, try_get_opt_string, try_get_opt_u64, try_get_payload, try_get_string};

/// Frames sent from the client to the server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Connect(ConnectData),
    Subscribe(SubscribeData),
    Unsubscribe(UnsubscribeData),
    Emit(EmitData),
    Query(QueryData),
    QueryAck(QueryAckData),
    AckEv(AckEvData),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectData {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeData {
    pub channel: String,
    pub start_pos: Option<u64>,
    pub start_timestamp: Option<u64>,
    pub durable_id: Option<String>,
    pub matcher: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnsubscribeData {
    pub sub_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmitData {
    pub channel: String,
    pub session_id: i32,
    pub event: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryData {
    pub query_id: u32,
    pub binder: String,
    pub matcher: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryAckData {
    pub query_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AckEvData {
    pub sub_id: u32,
    pub bytes: u32,
}

impl WireFrame for ClientFrame {
    fn kind(&self) -> FrameKind {
        match self {
            ClientFrame::Connect(_) => FrameKind::Connect,
            ClientFrame::Subscribe(_) => FrameKind::Subscribe,
            ClientFrame::Unsubscribe(_) => FrameKind::Unsubscribe,
            ClientFrame::Emit(_) => FrameKind::Emit,
            ClientFrame::Query(_) => FrameKind::Query,
            ClientFrame::QueryAck(_) => FrameKind::QueryAck,
            ClientFrame::AckEv(_) => FrameKind::AckEv,
        }
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind().into());
        match self {
            ClientFrame::Connect(data) => {
                put_string(buf, &data.version);
            }
            ClientFrame::Subscribe(data) => {
                put_string(buf, &data.channel);
                put_opt_u64(buf, data.start_pos);
                put_opt_u64(buf, data.start_timestamp);
                put_opt_string(buf, data.durable_id.as_deref());
                put_opt_payload(buf, data.matcher.as_ref());
            }
            ClientFrame::Unsubscribe(data) => {
                buf.put_u32(data.sub_id);
            }
            ClientFrame::Emit(data) => {
                put_string(buf, &data.channel);
                buf.put_i32(data.session_id);
                put_payload(buf, &data.event);
            }
            ClientFrame::Query(data) => {
                buf.put_u32(data.query_id);
                put_string(buf, &data.binder);
                put_payload(buf, &data.matcher);
            }
            ClientFrame::QueryAck(data) => {
                buf.put_u32(data.query_id);
            }
            ClientFrame::AckEv(data) => {
                buf.put_u32(data.sub_id);
                buf.put_u32(data.bytes);
            }
        }
    }

    fn deser(buf: &[u8]) -> anyhow::Result<ClientFrame> {
        let mut buf = buf;
        let kind = FrameKind::try_from_primitive(buf.try_get_u8()?)
            .map_err(|e| anyhow!("invalid frame kind {}", e.number))?;

        let frame = match kind {
            FrameKind::Connect => ClientFrame::Connect(ConnectData {
                version: try_get_string(&mut buf)?,
            }),
            FrameKind::Subscribe => ClientFrame::Subscribe(SubscribeData {
                channel: try_get_string(&mut buf)?,
                start_pos: try_get_opt_u64(&mut buf)?,
                start_timestamp: try_get_opt_u64(&mut buf)?,
                durable_id: try_get_opt_string(&mut buf)?,
                matcher: try_get_opt_payload(&mut buf)?,
            }),
            FrameKind::Unsubscribe => ClientFrame::Unsubscribe(UnsubscribeData {
                sub_id: buf.try_get_u32()?,
            }),
            FrameKind::Emit => ClientFrame::Emit(EmitData {
                channel: try_get_string(&mut buf)?,
                session_id: buf.try_get_i32()?,
                event: try_get_payload(&mut buf)?,
            }),
            FrameKind::Query => ClientFrame::Query(QueryData {
                query_id: buf.try_get_u32()?,
                binder: try_get_string(&mut buf)?,
                matcher: try_get_payload(&mut buf)?,
            }),
            FrameKind::QueryAck => ClientFrame::QueryAck(QueryAckData {
                query_id: buf.try_get_u32()?,
            }),
            FrameKind::AckEv => ClientFrame::AckEv(AckEvData {
                sub_id: buf.try_get_u32()?,
                bytes: buf.try_get_u32()?,
            }),
            other => return Err(anyhow!("{:?} is not a client frame", other)),
        };

        if buf.has_remaining() {
            return Err(anyhow!("{} trailing bytes after {:?} frame", buf.remaining(), kind));
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case::connect(ClientFrame::Connect(ConnectData { version: "0.1".to_string() }))]
    #[case::subscribe_minimal(ClientFrame::Subscribe(SubscribeData {
        channel: "orders".to_string(),
        start_pos: None,
        start_timestamp: None,
        durable_id: None,
        matcher: None,
    }))]
    #[case::subscribe_full(ClientFrame::Subscribe(SubscribeData {
        channel: "orders".to_string(),
        start_pos: Some(1000),
        start_timestamp: Some(1_700_000_000_000),
        durable_id: Some("billing".to_string()),
        matcher: Some(json!({"state": "open"})),
    }))]
    #[case::unsubscribe(ClientFrame::Unsubscribe(UnsubscribeData { sub_id: 12 }))]
    #[case::emit(ClientFrame::Emit(EmitData { channel: "orders".to_string(), session_id: -1, event: json!({"id": 5, "amount": 3.5}) }))]
    #[case::query(ClientFrame::Query(QueryData { query_id: 7, binder: "customers".to_string(), matcher: json!({"$match": {"id": 42}}) }))]
    #[case::query_ack(ClientFrame::QueryAck(QueryAckData { query_id: 7 }))]
    #[case::ack_ev(ClientFrame::AckEv(AckEvData { sub_id: 3, bytes: 120 }))]
    fn test_ser_deser(#[case] frame: ClientFrame) {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(ClientFrame::deser(&buf).unwrap(), frame);
    }

    #[test]
    fn test_ser_emit_layout() {
        let mut buf = BytesMut::new();
        ClientFrame::Emit(EmitData { channel: "c".to_string(), session_id: 2, event: json!(1) }).ser(&mut buf);
        assert_eq!(buf.as_ref(), &[4, 1, b'c', 0,0,0,2, 1, b'1']);
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::unknown_kind(b"\x20")]
    #[case::server_kind(b"\x47")]
    #[case::truncated(b"\x07\0\0\0\x03\0\0")]
    #[case::trailing(b"\x06\0\0\0\x01\xff")]
    fn test_deser_invalid(#[case] buf: &[u8]) {
        assert!(ClientFrame::deser(buf).is_err());
    }
}
