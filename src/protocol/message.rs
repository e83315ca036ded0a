use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use integer_encoding::VarInt;
use once_cell::sync::OnceCell;

use crate::{AppError, AppResult};

/// Minimum wire size of a route-bearing message: flag byte plus a
/// compressed route code.
pub const MSG_HEAD_LEN: usize = 3;

const COMPRESS_FLAG: u8 = 0x01;

/// Application-level message kinds multiplexed inside data packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0,
    Notify = 1,
    Response = 2,
    Push = 3,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> AppResult<MessageKind> {
        match value {
            0 => Ok(MessageKind::Request),
            1 => Ok(MessageKind::Notify),
            2 => Ok(MessageKind::Response),
            3 => Ok(MessageKind::Push),
            other => Err(AppError::MalformedProtocol(format!(
                "unknown message kind {}",
                other
            ))),
        }
    }

    /// Request and response messages carry a correlation id.
    pub fn has_id(&self) -> bool {
        matches!(self, MessageKind::Request | MessageKind::Response)
    }

    /// Everything except a response names its route.
    pub fn has_route(&self) -> bool {
        !matches!(self, MessageKind::Response)
    }
}

/// The shared route-compression dictionary.
///
/// Installed once at startup from the registered handler routes and read
/// concurrently thereafter; there is no runtime mutation.
#[derive(Debug, Default)]
pub struct RouteDictionary {
    codes: HashMap<String, u16>,
    routes: HashMap<u16, String>,
}

static ROUTE_DICTIONARY: OnceCell<RouteDictionary> = OnceCell::new();

impl RouteDictionary {
    /// Installs the process-wide dictionary, assigning codes in iteration
    /// order. A second call is a no-op returning the already installed
    /// dictionary.
    pub fn install<I, S>(route_names: I) -> &'static RouteDictionary
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ROUTE_DICTIONARY.get_or_init(|| {
            let mut codes = HashMap::new();
            let mut routes = HashMap::new();
            for (code, name) in route_names.into_iter().enumerate() {
                let name = name.into();
                codes.insert(name.clone(), code as u16);
                routes.insert(code as u16, name);
            }
            RouteDictionary { codes, routes }
        })
    }

    pub fn get() -> Option<&'static RouteDictionary> {
        ROUTE_DICTIONARY.get()
    }

    pub fn code_of(&self, route: &str) -> Option<u16> {
        self.codes.get(route).copied()
    }

    pub fn route_of(&self, code: u16) -> Option<&str> {
        self.routes.get(&code).map(String::as_str)
    }

    /// Route → code map as advertised to clients in the handshake payload.
    pub fn entries(&self) -> &HashMap<String, u16> {
        &self.codes
    }
}

/// One application message: `[flag:1][varint id | route][payload]`.
///
/// Flag byte is `(kind << 1) | compress`. The route travels either as a
/// 2-byte big-endian dictionary code or as a 1-byte length-prefixed
/// literal string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub id: u64,
    pub route: Option<String>,
    pub payload: Bytes,
}

impl Message {
    pub fn request(id: u64, route: impl Into<String>, payload: Bytes) -> Message {
        Message {
            kind: MessageKind::Request,
            id,
            route: Some(route.into()),
            payload,
        }
    }

    pub fn notify(route: impl Into<String>, payload: Bytes) -> Message {
        Message {
            kind: MessageKind::Notify,
            id: 0,
            route: Some(route.into()),
            payload,
        }
    }

    pub fn response(id: u64, payload: Bytes) -> Message {
        Message {
            kind: MessageKind::Response,
            id,
            route: None,
            payload,
        }
    }

    pub fn push(route: impl Into<String>, payload: Bytes) -> Message {
        Message {
            kind: MessageKind::Push,
            id: 0,
            route: Some(route.into()),
            payload,
        }
    }

    pub fn encode(&self) -> AppResult<Bytes> {
        let route_code = match (&self.route, self.kind.has_route()) {
            (Some(route), true) => {
                RouteDictionary::get().and_then(|dict| dict.code_of(route))
            }
            (None, true) => {
                return Err(AppError::MalformedProtocol(format!(
                    "{:?} message without a route",
                    self.kind
                )))
            }
            _ => None,
        };

        let mut buf = BytesMut::with_capacity(MSG_HEAD_LEN + self.payload.len() + 16);
        let mut flag = (self.kind as u8) << 1;
        if route_code.is_some() {
            flag |= COMPRESS_FLAG;
        }
        buf.put_u8(flag);

        if self.kind.has_id() {
            buf.put_slice(&self.id.encode_var_vec());
        }

        if self.kind.has_route() {
            match route_code {
                Some(code) => buf.put_u16(code),
                None => {
                    let route = self.route.as_deref().unwrap_or_default();
                    if route.len() > u8::MAX as usize {
                        return Err(AppError::MalformedProtocol(format!(
                            "route '{}' longer than 255 bytes",
                            route
                        )));
                    }
                    buf.put_u8(route.len() as u8);
                    buf.put_slice(route.as_bytes());
                }
            }
        }

        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(mut data: Bytes) -> AppResult<Message> {
        if data.is_empty() {
            return Err(AppError::MalformedProtocol("empty message".to_string()));
        }
        let total = data.remaining();
        let flag = data.get_u8();
        let kind = MessageKind::from_u8(flag >> 1)?;
        let compressed = flag & COMPRESS_FLAG != 0;

        if kind.has_route() && total < MSG_HEAD_LEN {
            return Err(AppError::MalformedProtocol(format!(
                "{} bytes is shorter than the minimum message header",
                total
            )));
        }

        let id = if kind.has_id() {
            let (id, read) = u64::decode_var(data.chunk()).ok_or_else(|| {
                AppError::MalformedProtocol("truncated message id varint".to_string())
            })?;
            data.advance(read);
            id
        } else {
            0
        };

        let route = if kind.has_route() {
            if compressed {
                if data.remaining() < 2 {
                    return Err(AppError::MalformedProtocol(
                        "truncated route code".to_string(),
                    ));
                }
                let code = data.get_u16();
                let dict = RouteDictionary::get().ok_or_else(|| {
                    AppError::MalformedProtocol(format!(
                        "compressed route {} without a dictionary",
                        code
                    ))
                })?;
                let route = dict.route_of(code).ok_or_else(|| {
                    AppError::MalformedProtocol(format!(
                        "no dictionary entry for route code {}",
                        code
                    ))
                })?;
                Some(route.to_string())
            } else {
                if data.remaining() < 1 {
                    return Err(AppError::MalformedProtocol(
                        "truncated route length".to_string(),
                    ));
                }
                let len = data.get_u8() as usize;
                if data.remaining() < len {
                    return Err(AppError::MalformedProtocol(
                        "truncated route literal".to_string(),
                    ));
                }
                let raw = data.split_to(len);
                let route = std::str::from_utf8(&raw).map_err(|_| {
                    AppError::MalformedProtocol("route is not valid utf-8".to_string())
                })?;
                Some(route.to_string())
            }
        } else {
            None
        };

        Ok(Message {
            kind,
            id,
            route,
            payload: data,
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn install_test_dict() -> &'static RouteDictionary {
        RouteDictionary::install(["conn.ping", "room.join"])
    }

    #[test]
    fn test_round_trip_all_kinds() {
        install_test_dict();
        let messages = vec![
            Message::request(42, "room.enter", Bytes::from_static(b"{}")),
            Message::request(1, "room.join", Bytes::from_static(b"{\"x\":1}")),
            Message::notify("room.leave", Bytes::new()),
            Message::notify("conn.ping", Bytes::from_static(b"p")),
            Message::response(42, Bytes::from_static(b"ok")),
            Message::response(0, Bytes::from_static(b"ok")),
            Message::push("conn.ping", Bytes::from_static(b"tick")),
            Message::push("chat.said", Bytes::from_static(b"hey")),
        ];
        for message in messages {
            let decoded = Message::decode(message.encode().unwrap()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_compressed_route_uses_two_bytes() {
        let dict = install_test_dict();
        let code = dict.code_of("room.join").unwrap();
        let wire = Message::notify("room.join", Bytes::new()).encode().unwrap();
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0] & COMPRESS_FLAG, COMPRESS_FLAG);
        assert_eq!(u16::from_be_bytes([wire[1], wire[2]]), code);
    }

    #[test]
    fn test_literal_route_is_length_prefixed() {
        // not present in any installed dictionary, always literal
        let wire = Message::notify("zone.sweep", Bytes::new()).encode().unwrap();
        assert_eq!(wire[0] & COMPRESS_FLAG, 0);
        assert_eq!(wire[1] as usize, "zone.sweep".len());
        assert_eq!(&wire[2..], b"zone.sweep");
    }

    #[rstest]
    #[case(0, 1)]
    #[case(127, 1)]
    #[case(128, 2)]
    #[case(16384, 3)]
    fn test_varint_id_width(#[case] id: u64, #[case] width: usize) {
        let message = Message::response(id, Bytes::new());
        let wire = message.encode().unwrap();
        assert_eq!(wire.len(), 1 + width);
        assert_eq!(Message::decode(wire).unwrap().id, id);
    }

    #[test]
    fn test_short_route_bearing_message_rejected() {
        let wire = Bytes::from_static(&[(MessageKind::Notify as u8) << 1, 0]);
        assert!(Message::decode(wire).is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let wire = Bytes::from_static(&[7 << 1, 0, 0]);
        assert!(Message::decode(wire).is_err());
    }

    #[test]
    fn test_unknown_dictionary_code_rejected() {
        install_test_dict();
        let mut wire = BytesMut::new();
        wire.put_u8(((MessageKind::Push as u8) << 1) | COMPRESS_FLAG);
        wire.put_u16(0x7fff);
        assert!(Message::decode(wire.freeze()).is_err());
    }

    #[test]
    fn test_empty_message_rejected() {
        assert!(Message::decode(Bytes::new()).is_err());
    }
}
