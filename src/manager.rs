use async_trait::async_trait;
use bitflags::bitflags;

use crate::error::ChannelResult;
use crate::frame::connection_header::ConnectionType;
use crate::host::HostId;
use crate::message::Message;

bitflags! {
    /// Filter mask for [ConnectionManager::release_connections].
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct ConnectionTypes: u8 {
        const PERSISTENT = 1;
        const INVOCATION = 2;
    }
}

impl ConnectionTypes {
    pub fn matches(&self, connection_type: ConnectionType) -> bool {
        match connection_type {
            ConnectionType::Persistent => self.contains(ConnectionTypes::PERSISTENT),
            ConnectionType::Invocation => self.contains(ConnectionTypes::INVOCATION),
        }
    }
}

/// Key of one logical connection: the peer plus an optional connection name, so
///  several independent streams to the same peer can coexist.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionKey {
    pub host: HostId,
    pub connection_name: Option<String>,
}

impl ConnectionKey {
    pub fn new(host: HostId, connection_name: Option<String>) -> ConnectionKey {
        ConnectionKey {
            host,
            connection_name,
        }
    }
}

/// The carrier-independent contract every connection manager implements. One manager
///  per carrier owns its host registry and the full connect/accept/reconnect/ping
///  state machine.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Deliver a message to its recipient, establishing the physical connection
    ///  lazily. Blocks at most until the message's deadline; an already-elapsed
    ///  deadline fails with `Timeout` before any carrier I/O. Failures route into
    ///  connection-failure handling - the caller never observes a half-sent state.
    async fn send(&self, message: Message) -> ChannelResult<()>;

    /// Terminate all connections matching the filter (`None` host means all).
    ///  Idempotent: already-torn-down connections are silently skipped, and every
    ///  affected connection fires exactly one closed event.
    async fn release_connections(
        &self,
        host: Option<HostId>,
        mask: ConnectionTypes,
        reason: &str,
    );

    /// Rejects an address that is already registered for listening.
    async fn start_listening(&self, address: &str) -> ChannelResult<()>;

    /// Safe to call concurrently with an in-flight accept.
    async fn stop_listening(&self, address: &str) -> ChannelResult<()>;
}
