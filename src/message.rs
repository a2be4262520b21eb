use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::deadline::Deadline;
use crate::error::ChannelError;
use crate::frame::connection_header::ConnectionType;
use crate::host::HostId;

/// An opaque addressed payload handed to a connection manager for delivery.
///
/// The caller owns the message until the `send` call returns; the manager does not
///  retain it beyond send completion or failure.
#[derive(Debug, Clone)]
pub struct Message {
    pub to: HostId,
    pub content: Bytes,
    /// one-way messages do not expect a response payload
    pub one_way: bool,
    /// outermost finish deadline - all nested waits compute their budget from this
    pub deadline: Deadline,
    /// distinguishes multiple independent logical connections to the same peer
    pub connection_name: Option<String>,
}

impl Message {
    pub fn new(to: HostId, content: Bytes, deadline: Deadline) -> Message {
        Message {
            to,
            content,
            one_way: false,
            deadline,
            connection_name: None,
        }
    }

    pub fn one_way(to: HostId, content: Bytes, deadline: Deadline) -> Message {
        Message {
            to,
            content,
            one_way: true,
            deadline,
            connection_name: None,
        }
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Message {
        self.connection_name = Some(name.into());
        self
    }
}

/// The sole handoff point from this transport core to the message-handling layer
///  above it (RPC dispatch etc.). Decoded sub-messages of one packet are delivered
///  in encoding order.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn handle_message(
        &self,
        content: Bytes,
        from: HostId,
        connection_type: ConnectionType,
        connection_name: Option<String>,
        one_way: bool,
    );

    /// The reverse handoff: a queued outbound message can never be sent.
    async fn dispatch_failure(&self, message: Message, error: ChannelError);
}
