use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::TryFromPrimitive;
use serde_json::Value;

use crate::client::client_error::ClientError;
use crate::codec::{FrameKind, WireFrame};
use crate::util::buf::{put_payload, put_string, try_get_bool, try_get_payload, try_get_string};

/// Frames sent from the server to the client
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// the reply to a CONNECT request, the first response on any connection
    ConnectResponse(ResponseData),
    /// the generic reply to requests that carry no data in their response, e.g. EMIT
    Response(ResponseData),
    SubResponse(SubResponseData),
    /// the first phase of a query's result; the results themselves follow as QUERYRESULT frames
    QueryResponse(QueryResponseData),
    /// an event delivered to a subscription
    Recev(RecevData),
    QueryResult(QueryResultData),
    Ping,
}

/// Outcome of a request. If `ok` is false, the error fields describe the server-side failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseData {
    pub ok: bool,
    pub err_code: String,
    pub err_msg: String,
}
impl ResponseData {
    pub fn ok() -> ResponseData {
        ResponseData {
            ok: true,
            err_code: String::new(),
            err_msg: String::new(),
        }
    }

    pub fn error(code: impl Into<String>, msg: impl Into<String>) -> ResponseData {
        ResponseData {
            ok: false,
            err_code: code.into(),
            err_msg: msg.into(),
        }
    }

    pub fn into_result(self) -> Result<(), ClientError> {
        if self.ok {
            Ok(())
        }
        else {
            Err(ClientError::Remote {
                code: self.err_code,
                message: self.err_msg,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubResponseData {
    pub response: ResponseData,
    pub sub_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponseData {
    pub response: ResponseData,
    pub query_id: u32,
    pub num_results: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecevData {
    pub sub_id: u32,
    pub channel: String,
    pub timestamp: u64,
    pub sequence_number: u64,
    pub event: Value,
    /// the event's encoded size, which is the amount of credit returned when the event is
    ///  acknowledged
    pub size_bytes: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResultData {
    pub query_id: u32,
    pub result: Value,
}

impl WireFrame for ServerFrame {
    fn kind(&self) -> FrameKind {
        match self {
            ServerFrame::ConnectResponse(_) => FrameKind::ConnectResponse,
            ServerFrame::Response(_) => FrameKind::Response,
            ServerFrame::SubResponse(_) => FrameKind::SubResponse,
            ServerFrame::QueryResponse(_) => FrameKind::QueryResponse,
            ServerFrame::Recev(_) => FrameKind::Recev,
            ServerFrame::QueryResult(_) => FrameKind::QueryResult,
            ServerFrame::Ping => FrameKind::Ping,
        }
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind().into());
        match self {
            ServerFrame::ConnectResponse(data) |
            ServerFrame::Response(data) => Self::ser_response(data, buf),
            ServerFrame::SubResponse(data) => {
                Self::ser_response(&data.response, buf);
                buf.put_u32(data.sub_id);
            }
            ServerFrame::QueryResponse(data) => {
                Self::ser_response(&data.response, buf);
                buf.put_u32(data.query_id);
                buf.put_u32(data.num_results);
            }
            ServerFrame::Recev(data) => {
                buf.put_u32(data.sub_id);
                put_string(buf, &data.channel);
                buf.put_u64(data.timestamp);
                buf.put_u64(data.sequence_number);
                buf.put_u32(data.size_bytes);
                put_payload(buf, &data.event);
            }
            ServerFrame::QueryResult(data) => {
                buf.put_u32(data.query_id);
                put_payload(buf, &data.result);
            }
            ServerFrame::Ping => {}
        }
    }

    fn deser(buf: &[u8]) -> anyhow::Result<ServerFrame> {
        let mut buf = buf;
        let kind = FrameKind::try_from_primitive(buf.try_get_u8()?)
            .map_err(|e| anyhow!("invalid frame kind {}", e.number))?;

        let frame = match kind {
            FrameKind::ConnectResponse => ServerFrame::ConnectResponse(Self::deser_response(&mut buf)?),
            FrameKind::Response => ServerFrame::Response(Self::deser_response(&mut buf)?),
            FrameKind::SubResponse => ServerFrame::SubResponse(SubResponseData {
                response: Self::deser_response(&mut buf)?,
                sub_id: buf.try_get_u32()?,
            }),
            FrameKind::QueryResponse => ServerFrame::QueryResponse(QueryResponseData {
                response: Self::deser_response(&mut buf)?,
                query_id: buf.try_get_u32()?,
                num_results: buf.try_get_u32()?,
            }),
            FrameKind::Recev => ServerFrame::Recev(RecevData {
                sub_id: buf.try_get_u32()?,
                channel: try_get_string(&mut buf)?,
                timestamp: buf.try_get_u64()?,
                sequence_number: buf.try_get_u64()?,
                size_bytes: buf.try_get_u32()?,
                event: try_get_payload(&mut buf)?,
            }),
            FrameKind::QueryResult => ServerFrame::QueryResult(QueryResultData {
                query_id: buf.try_get_u32()?,
                result: try_get_payload(&mut buf)?,
            }),
            FrameKind::Ping => ServerFrame::Ping,
            other => return Err(anyhow!("{:?} is not a server frame", other)),
        };

        if buf.has_remaining() {
            return Err(anyhow!("{} trailing bytes after {:?} frame", buf.remaining(), kind));
        }
        Ok(frame)
    }
}

impl ServerFrame {
    fn ser_response(data: &ResponseData, buf: &mut BytesMut) {
        buf.put_u8(data.ok as u8);
        if !data.ok {
            put_string(buf, &data.err_code);
            put_string(buf, &data.err_msg);
        }
    }

    fn deser_response(buf: &mut impl Buf) -> anyhow::Result<ResponseData> {
        if try_get_bool(buf)? {
            Ok(ResponseData::ok())
        }
        else {
            let err_code = try_get_string(buf)?;
            let err_msg = try_get_string(buf)?;
            Ok(ResponseData::error(err_code, err_msg))
        }
    }
}
