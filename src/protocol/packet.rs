use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

pub const PACKET_HEAD_LEN: usize = 4;
/// the length field is 3 bytes wide
pub const MAX_PACKET_BODY: usize = (1 << 24) - 1;

/// Zero-length heartbeat packet, precomputed once and reused for all
/// heartbeat sends.
pub const HEARTBEAT_PACKET: Bytes = Bytes::from_static(&[PacketType::Heartbeat as u8, 0, 0, 0]);

/// Packet types of the client-facing wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Handshake = 1,
    HandshakeAck = 2,
    Heartbeat = 3,
    Data = 4,
    Kick = 5,
}

impl PacketType {
    pub fn from_u8(value: u8) -> AppResult<PacketType> {
        match value {
            1 => Ok(PacketType::Handshake),
            2 => Ok(PacketType::HandshakeAck),
            3 => Ok(PacketType::Heartbeat),
            4 => Ok(PacketType::Data),
            5 => Ok(PacketType::Kick),
            other => Err(AppError::MalformedProtocol(format!(
                "unknown packet type {}",
                other
            ))),
        }
    }
}

/// A length-prefixed packet: `[type:1][length:3 big-endian][payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, payload: Bytes) -> Packet {
        Packet {
            packet_type,
            payload,
        }
    }

    /// Serializes the packet into its wire form.
    pub fn pack(packet_type: PacketType, payload: &[u8]) -> AppResult<Bytes> {
        if payload.len() > MAX_PACKET_BODY {
            return Err(AppError::MalformedProtocol(format!(
                "packet body of {} bytes exceeds the 3-byte length field",
                payload.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(PACKET_HEAD_LEN + payload.len());
        buf.put_u8(packet_type as u8);
        let len = payload.len() as u32;
        buf.put_u8((len >> 16) as u8);
        buf.put_u8((len >> 8) as u8);
        buf.put_u8(len as u8);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    fn check(buffer: &mut BytesMut) -> AppResult<usize> {
        if buffer.remaining() < PACKET_HEAD_LEN {
            return Err(Incomplete);
        }
        let head = buffer.get(0..PACKET_HEAD_LEN).unwrap();
        PacketType::from_u8(head[0])?;
        let body_size =
            ((head[1] as usize) << 16) | ((head[2] as usize) << 8) | (head[3] as usize);
        if buffer.remaining() < PACKET_HEAD_LEN + body_size {
            buffer.reserve(PACKET_HEAD_LEN + body_size);
            return Err(Incomplete);
        }
        Ok(body_size)
    }

    /// Parses one packet off the front of `buffer`.
    ///
    /// Returns `Ok(None)` and leaves the buffer untouched when fewer than 4
    /// header bytes are available or the declared length exceeds the bytes
    /// buffered so far; the caller must keep reading. A length field
    /// inconsistent with the buffer is never under- or over-read.
    pub fn parse(buffer: &mut BytesMut) -> AppResult<Option<Packet>> {
        match Packet::check(buffer) {
            Ok(body_size) => {
                let packet_type = PacketType::from_u8(buffer.get_u8())?;
                buffer.advance(3);
                let payload = buffer.split_to(body_size).freeze();
                Ok(Some(Packet {
                    packet_type,
                    payload,
                }))
            }
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
