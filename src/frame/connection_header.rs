use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{ChannelError, ChannelResult};
use crate::host::HostId;

/// Header exchanged once per physical connection establishment:
/// ```ascii
/// 0:  protocol version (u8)
/// 1:  connection type (u8)
/// 2:  peer host id (16 bytes)
/// 18: connection name length (varint), then UTF-8 name bytes
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionHeader {
    pub protocol_version: u8,
    pub connection_type: ConnectionType,
    pub host_id: HostId,
    pub connection_name: Option<String>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ConnectionType {
    /// long-lived named channel, kept alive and reconnected across carrier failures
    Persistent = 0,
    /// short-lived channel for a single invocation
    Invocation = 1,
}

impl ConnectionHeader {
    pub const PROTOCOL_VERSION_1: u8 = 1;

    pub fn new(
        connection_type: ConnectionType,
        host_id: HostId,
        connection_name: Option<String>,
    ) -> ConnectionHeader {
        ConnectionHeader {
            protocol_version: Self::PROTOCOL_VERSION_1,
            connection_type,
            host_id,
            connection_name,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.protocol_version);
        buf.put_u8(self.connection_type.into());
        self.host_id.ser(buf);

        let name = self.connection_name.as_deref().unwrap_or("");
        buf.put_usize_varint(name.len());
        buf.put_slice(name.as_bytes());
    }

    pub fn deser(buf: &mut impl Buf) -> ChannelResult<ConnectionHeader> {
        let protocol_version = buf.try_get_u8()
            .map_err(|_| ChannelError::incorrect_data("truncated connection header"))?;
        if protocol_version != Self::PROTOCOL_VERSION_1 {
            return Err(ChannelError::IncorrectData {
                detail: format!("unsupported protocol version {}", protocol_version),
            });
        }

        let raw_type = buf.try_get_u8()
            .map_err(|_| ChannelError::incorrect_data("truncated connection header"))?;
        let connection_type = ConnectionType::try_from(raw_type)
            .map_err(|_| ChannelError::IncorrectData {
                detail: format!("invalid connection type {}", raw_type),
            })?;

        let host_id = HostId::deser(buf)?;

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

        Ok(ConnectionHeader {
            protocol_version,
            connection_type,
            host_id,
            connection_name,
        })
    }
}
