use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{ChannelError, ChannelResult};
use crate::host::HostId;

pub const TUNNEL_PROTOCOL_VERSION_1: u8 = 1;

/// Discriminator of one tunnel packet, the first meaningful byte of every body.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum HttpPacketType {
    /// sender connection establishment, carries a security handshake frame
    Establishing = 0,
    /// establishment that also discards all previous per-connection state
    EstablishingResetConnection = 1,
    /// listener long poll: "answer me when you have something to deliver"
    Listening = 2,
    /// a regular message exchange
    Usual = 3,
    /// response to a repeated sequence, replayed from the response cache
    RequestRepeated = 4,
    /// the sequence number fits neither "next" nor "repeated"
    Desynchronization = 5,
    /// processing failed on the answering side; the payload is a failure report
    SenderError = 6,
    /// the long poll expired without traffic; the listener re-polls immediately
    ListenerTimedOut = 7,
    /// the connection was closed deliberately, not by a fault
    ClosedManually = 8,
}

/// One tunnel packet: the fixed header plus the security-framed payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TunnelPacket {
    pub packet_type: HttpPacketType,
    pub sequence: u64,
    pub host_id: HostId,
    pub connection_name: Option<String>,
    pub payload: Bytes,
}

impl TunnelPacket {
    pub fn new(
        packet_type: HttpPacketType,
        sequence: u64,
        host_id: HostId,
        connection_name: Option<String>,
        payload: Bytes,
    ) -> TunnelPacket {
        TunnelPacket {
            packet_type,
            sequence,
            host_id,
            connection_name,
            payload,
        }
    }

    pub fn ser(&self) -> Bytes {
        let name = self.connection_name.as_deref().unwrap_or("");
        let mut buf = BytesMut::with_capacity(27 + name.len() + self.payload.len());

        buf.put_u8(TUNNEL_PROTOCOL_VERSION_1);
        buf.put_u8(self.packet_type.into());
        buf.put_u64(self.sequence);
        self.host_id.ser(&mut buf);
        buf.put_usize_varint(name.len());
        buf.put_slice(name.as_bytes());
        buf.put_slice(&self.payload);

        buf.freeze()
    }

    pub fn deser(mut buf: Bytes) -> ChannelResult<TunnelPacket> {
        let version = buf.try_get_u8()
            .map_err(|_| ChannelError::incorrect_data("truncated tunnel packet"))?;
        if version != TUNNEL_PROTOCOL_VERSION_1 {
            return Err(ChannelError::IncorrectData {
                detail: format!("unsupported tunnel protocol version {}", version),
            });
        }

        let raw_type = buf.try_get_u8()
            .map_err(|_| ChannelError::incorrect_data("truncated tunnel packet"))?;
        let packet_type = HttpPacketType::try_from(raw_type)
            .map_err(|_| ChannelError::IncorrectData {
                detail: format!("invalid tunnel packet type {}", raw_type),
            })?;

        let sequence = buf.try_get_u64()
            .map_err(|_| ChannelError::incorrect_data("truncated tunnel sequence"))?;
        let host_id = HostId::deser(&mut buf)?;

        let name_len = buf.try_get_usize_varint()
            .map_err(|_| ChannelError::incorrect_data("truncated connection name length"))?;
        if name_len > buf.remaining() {
            return Err(ChannelError::IncorrectData {
                detail: format!(
                    "connection name declares {} bytes, only {} available",
                    name_len,
                    buf.remaining()
                ),
            });
        }
        let name_bytes = buf.copy_to_bytes(name_len);
        let connection_name = if name_bytes.is_empty() {
            None
        }
        else {
            Some(
                String::from_utf8(name_bytes.to_vec())
                    .map_err(|_| ChannelError::incorrect_data("connection name is not valid UTF-8"))?,
            )
        };

        Ok(TunnelPacket {
            packet_type,
            sequence,
            host_id,
            connection_name,
            payload: buf,
        })
    }
}
