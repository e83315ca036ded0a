use std::io::{self, ErrorKind};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;

use crate::protocol::{Packet, RpcFrame};
use crate::AppResult;

/// Read side of a client-facing connection, buffering bytes until a complete
/// packet can be parsed.
#[derive(Debug)]
pub struct PacketConnection {
    reader: OwnedReadHalf,
    buffer: BytesMut,
}

impl PacketConnection {
    pub fn new(reader: OwnedReadHalf, buffer_size: usize) -> PacketConnection {
        PacketConnection {
            reader,
            buffer: BytesMut::with_capacity(buffer_size),
        }
    }

    /// Reads the next packet.
    ///
    /// `Ok(None)` means the peer closed the connection gracefully; an error
    /// means a protocol violation or a close in the middle of a frame, and
    /// the connection should be dropped.
    pub async fn read_packet(&mut self) -> AppResult<Option<Packet>> {
        loop {
            if let Some(packet) = Packet::parse(&mut self.buffer)? {
                return Ok(Some(packet));
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }
}

/// Read side of a server-to-server connection carrying framed rpc records.
#[derive(Debug)]
pub struct RpcConnection {
    reader: OwnedReadHalf,
    buffer: BytesMut,
    max_record: usize,
}

impl RpcConnection {
    pub fn new(reader: OwnedReadHalf, buffer_size: usize, max_record: usize) -> RpcConnection {
        RpcConnection {
            reader,
            buffer: BytesMut::with_capacity(buffer_size),
            max_record,
        }
    }

    /// Reads the next framed record body, `Ok(None)` on graceful close.
    pub async fn read_record(&mut self) -> AppResult<Option<Bytes>> {
        loop {
            if let Some(record) = RpcFrame::parse(&mut self.buffer, self.max_record)? {
                return Ok(Some(record));
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }
}
