use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

/// Reserved route understood by every backend service: the frontend notifies
/// that a bridged session has closed. Carries no payload.
pub const SESSION_CLOSED_ROUTE: &str = "sys.session.closed";

/// Reserved route for the periodic liveness ping a frontend sends on each
/// established rpc connection. Never dispatched to a handler.
pub const CONNECTION_PING_ROUTE: &str = "sys.connection.ping";

const RPC_FRAME_HEAD_LEN: usize = 4;

// field tags of the request record
const TAG_KIND: u8 = 1;
const TAG_SEQ: u8 = 2;
const TAG_SESSION_ID: u8 = 3;
const TAG_MSG_ID: u8 = 4;
const TAG_SERVICE_METHOD: u8 = 5;
const TAG_PAYLOAD: u8 = 6;
// extra tags of the response record
const TAG_ROUTE: u8 = 7;
const TAG_ERROR: u8 = 8;

/// Invocation namespace of a routed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcKind {
    /// session-scoped call carrying bridged-session context
    Sys = 1,
    /// plain rpc without session semantics
    User = 2,
}

impl RpcKind {
    fn from_u8(value: u8) -> AppResult<RpcKind> {
        match value {
            1 => Ok(RpcKind::Sys),
            2 => Ok(RpcKind::User),
            other => Err(AppError::MalformedProtocol(format!(
                "unknown rpc kind {}",
                other
            ))),
        }
    }
}

/// Kind of a routed response, demultiplexed by the rpc client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcResponseKind {
    /// reply to the session's pending client request
    Response = 1,
    /// unsolicited push toward the session's client
    Push = 2,
    /// direct reply to an awaited call, correlated by sequence number
    RemoteResponse = 3,
}

impl RpcResponseKind {
    pub fn from_u8(value: u8) -> AppResult<RpcResponseKind> {
        match value {
            1 => Ok(RpcResponseKind::Response),
            2 => Ok(RpcResponseKind::Push),
            3 => Ok(RpcResponseKind::RemoteResponse),
            other => Err(AppError::UnknownResponseKind(other)),
        }
    }
}

/// One routed request travelling frontend → backend.
///
/// `msg_id` carries the originating client message id on forwarded sys
/// requests (0 for a notify) so the bridged session can enforce the
/// request/notify asymmetry remotely. Sequence numbers are scoped to one
/// client connection and never reused while a call is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    pub kind: RpcKind,
    pub seq: u64,
    pub session_id: u64,
    pub msg_id: u64,
    pub service_method: String,
    pub payload: Bytes,
}

/// One routed response travelling backend → frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub kind: RpcResponseKind,
    pub seq: u64,
    pub session_id: u64,
    pub route: String,
    pub error: String,
    pub payload: Bytes,
}

fn put_str(buf: &mut BytesMut, tag: u8, value: &str) {
    buf.put_u8(tag);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn put_u64(buf: &mut BytesMut, tag: u8, value: u64) {
    buf.put_u8(tag);
    buf.put_u64(value);
}

fn get_str(data: &mut Bytes) -> AppResult<String> {
    if data.remaining() < 2 {
        return Err(AppError::MalformedProtocol(
            "truncated string field".to_string(),
        ));
    }
    let len = data.get_u16() as usize;
    if data.remaining() < len {
        return Err(AppError::MalformedProtocol(
            "truncated string field".to_string(),
        ));
    }
    let raw = data.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| AppError::MalformedProtocol("string field is not utf-8".to_string()))
}

fn get_bytes(data: &mut Bytes) -> AppResult<Bytes> {
    if data.remaining() < 4 {
        return Err(AppError::MalformedProtocol(
            "truncated bytes field".to_string(),
        ));
    }
    let len = data.get_u32() as usize;
    if data.remaining() < len {
        return Err(AppError::MalformedProtocol(
            "truncated bytes field".to_string(),
        ));
    }
    Ok(data.split_to(len))
}

fn get_u64(data: &mut Bytes) -> AppResult<u64> {
    if data.remaining() < 8 {
        return Err(AppError::MalformedProtocol(
            "truncated integer field".to_string(),
        ));
    }
    Ok(data.get_u64())
}

impl RpcRequest {
    /// Encodes the record body as a tagged field map:
    /// `[field_count:u8]` then `[tag:u8][value]` per field.
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(32 + self.service_method.len() + self.payload.len());
        buf.put_u8(6);
        buf.put_u8(TAG_KIND);
        buf.put_u8(self.kind as u8);
        put_u64(&mut buf, TAG_SEQ, self.seq);
        put_u64(&mut buf, TAG_SESSION_ID, self.session_id);
        put_u64(&mut buf, TAG_MSG_ID, self.msg_id);
        put_str(&mut buf, TAG_SERVICE_METHOD, &self.service_method);
        put_bytes(&mut buf, TAG_PAYLOAD, &self.payload);
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> AppResult<RpcRequest> {
        if data.is_empty() {
            return Err(AppError::MalformedProtocol("empty rpc record".to_string()));
        }
        let mut record = RpcRequest {
            kind: RpcKind::Sys,
            seq: 0,
            session_id: 0,
            msg_id: 0,
            service_method: String::new(),
            payload: Bytes::new(),
        };
        let field_count = data.get_u8();
        for _ in 0..field_count {
            if data.is_empty() {
                return Err(AppError::MalformedProtocol(
                    "truncated rpc record".to_string(),
                ));
            }
            match data.get_u8() {
                TAG_KIND => {
                    if data.is_empty() {
                        return Err(AppError::MalformedProtocol(
                            "truncated rpc kind".to_string(),
                        ));
                    }
                    record.kind = RpcKind::from_u8(data.get_u8())?;
                }
                TAG_SEQ => record.seq = get_u64(&mut data)?,
                TAG_SESSION_ID => record.session_id = get_u64(&mut data)?,
                TAG_MSG_ID => record.msg_id = get_u64(&mut data)?,
                TAG_SERVICE_METHOD => record.service_method = get_str(&mut data)?,
                TAG_PAYLOAD => record.payload = get_bytes(&mut data)?,
                tag => {
                    return Err(AppError::MalformedProtocol(format!(
                        "unknown rpc request tag {}",
                        tag
                    )))
                }
            }
        }
        Ok(record)
    }
}

impl RpcResponse {
    pub fn remote(seq: u64, session_id: u64, result: AppResult<Bytes>) -> RpcResponse {
        let (payload, error) = match result {
            Ok(payload) => (payload, String::new()),
            Err(e) => (Bytes::new(), e.to_string()),
        };
        RpcResponse {
            kind: RpcResponseKind::RemoteResponse,
            seq,
            session_id,
            route: String::new(),
            error,
            payload,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            40 + self.route.len() + self.error.len() + self.payload.len(),
        );
        buf.put_u8(6);
        buf.put_u8(TAG_KIND);
        buf.put_u8(self.kind as u8);
        put_u64(&mut buf, TAG_SEQ, self.seq);
        put_u64(&mut buf, TAG_SESSION_ID, self.session_id);
        put_str(&mut buf, TAG_ROUTE, &self.route);
        put_str(&mut buf, TAG_ERROR, &self.error);
        put_bytes(&mut buf, TAG_PAYLOAD, &self.payload);
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> AppResult<RpcResponse> {
        if data.is_empty() {
            return Err(AppError::MalformedProtocol("empty rpc record".to_string()));
        }
        let mut record = RpcResponse {
            kind: RpcResponseKind::Response,
            seq: 0,
            session_id: 0,
            route: String::new(),
            error: String::new(),
            payload: Bytes::new(),
        };
        let field_count = data.get_u8();
        for _ in 0..field_count {
            if data.is_empty() {
                return Err(AppError::MalformedProtocol(
                    "truncated rpc record".to_string(),
                ));
            }
            match data.get_u8() {
                TAG_KIND => {
                    if data.is_empty() {
                        return Err(AppError::MalformedProtocol(
                            "truncated rpc response kind".to_string(),
                        ));
                    }
                    record.kind = RpcResponseKind::from_u8(data.get_u8())?;
                }
                TAG_SEQ => record.seq = get_u64(&mut data)?,
                TAG_SESSION_ID => record.session_id = get_u64(&mut data)?,
                TAG_ROUTE => record.route = get_str(&mut data)?,
                TAG_ERROR => record.error = get_str(&mut data)?,
                TAG_PAYLOAD => record.payload = get_bytes(&mut data)?,
                tag => {
                    return Err(AppError::MalformedProtocol(format!(
                        "unknown rpc response tag {}",
                        tag
                    )))
                }
            }
        }
        Ok(record)
    }
}

/// Length-prefixed framing for rpc records on a persistent connection:
/// `[len:4 big-endian][record]`, parsed incrementally.
pub struct RpcFrame;

impl RpcFrame {
    pub fn frame(record: Bytes) -> Bytes {
        let mut buf = BytesMut::with_capacity(RPC_FRAME_HEAD_LEN + record.len());
        buf.put_u32(record.len() as u32);
        buf.put_slice(&record);
        buf.freeze()
    }

    fn check(buffer: &mut BytesMut, max_record: usize) -> AppResult<usize> {
        if buffer.remaining() < RPC_FRAME_HEAD_LEN {
            return Err(Incomplete);
        }
        let head = buffer.get(0..RPC_FRAME_HEAD_LEN).unwrap();
        let record_size = u32::from_be_bytes(head.try_into().unwrap()) as usize;
        if record_size > max_record {
            return Err(AppError::MalformedProtocol(format!(
                "rpc record of {} bytes is too large",
                record_size
            )));
        }
        if buffer.remaining() < RPC_FRAME_HEAD_LEN + record_size {
            buffer.reserve(RPC_FRAME_HEAD_LEN + record_size);
            return Err(Incomplete);
        }
        Ok(record_size)
    }

    /// Parses one framed record body off the front of `buffer`, or returns
    /// `Ok(None)` leaving the buffer intact when a full frame is not
    /// buffered yet.
    pub fn parse(buffer: &mut BytesMut, max_record: usize) -> AppResult<Option<Bytes>> {
        match RpcFrame::check(buffer, max_record) {
            Ok(record_size) => {
                buffer.advance(RPC_FRAME_HEAD_LEN);
                Ok(Some(buffer.split_to(record_size).freeze()))
            }
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
