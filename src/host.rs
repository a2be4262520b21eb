use std::fmt::{Display, Formatter};
use std::time::Duration;

use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{ChannelError, ChannelResult};

/// Stable 16-byte identity of a peer, transmitted in every connection header.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct HostId([u8; 16]);

impl HostId {
    pub const SERIALIZED_LEN: usize = 16;

    pub fn new_random() -> HostId {
        HostId(*Uuid::new_v4().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> HostId {
        HostId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn deser(buf: &mut impl Buf) -> ChannelResult<HostId> {
        let mut bytes = [0u8; 16];
        for b in bytes.iter_mut() {
            *b = buf.try_get_u8()
                .map_err(|_| ChannelError::incorrect_data("truncated host id"))?;
        }
        Ok(HostId(bytes))
    }
}
impl Display for HostId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

/// Establishment state of the persistent connection towards one peer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PersistentConnectionState {
    NotEstablished,
    /// this side initiated the connection
    Opened,
    /// the connection was accepted from the peer's initiative
    Accepted,
}

/// Identity and liveness bookkeeping for one peer.
///
/// Connections refer to a host by its [HostId] key into the manager's registry -
///  they do not hold a reference to this struct, the registry owns the authoritative
///  lifetime.
pub struct RemoteHost {
    pub id: HostId,
    /// stable transport-independent logical address
    pub uri: String,
    /// transport-specific physical addresses, in resolution order
    pub urls: Vec<String>,
    pub connection_state: PersistentConnectionState,
    expires_at: Instant,
}

impl RemoteHost {
    pub fn new(id: HostId, uri: String, lifetime: Duration) -> RemoteHost {
        RemoteHost {
            id,
            uri,
            urls: Vec::new(),
            connection_state: PersistentConnectionState::NotEstablished,
            expires_at: Instant::now() + lifetime,
        }
    }

    /// Push the expiration deadline out; called on every successful exchange.
    pub fn renew(&mut self, lifetime: Duration) {
        self.expires_at = Instant::now() + lifetime;
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// The registry of known peers, owned by a connection manager.
#[derive(Default)]
pub struct HostRegistry {
    hosts: FxHashMap<HostId, RemoteHost>,
}

impl HostRegistry {
    pub fn get_or_create(&mut self, id: HostId, uri: &str, lifetime: Duration) -> &mut RemoteHost {
        self.hosts
            .entry(id)
            .or_insert_with(|| RemoteHost::new(id, uri.to_string(), lifetime))
    }

    pub fn get(&self, id: &HostId) -> Option<&RemoteHost> {
        self.hosts.get(id)
    }

    pub fn get_mut(&mut self, id: &HostId) -> Option<&mut RemoteHost> {
        self.hosts.get_mut(id)
    }

    pub fn remove(&mut self, id: &HostId) -> Option<RemoteHost> {
        self.hosts.remove(id)
    }

    pub fn expired_hosts(&self) -> Vec<HostId> {
        self.hosts
            .values()
            .filter(|h| h.is_expired())
            .map(|h| h.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    fn test_host_id_roundtrip() {
        let id = HostId::new_random();
        let mut buf = bytes::BytesMut::new();
        id.ser(&mut buf);
        assert_eq!(buf.len(), HostId::SERIALIZED_LEN);

        let parsed = HostId::deser(&mut buf.freeze()).unwrap();
        assert_eq!(parsed, id);
    }

    #[rstest]
    fn test_host_id_truncated() {
        let mut buf = &[1u8, 2, 3][..];
        assert!(HostId::deser(&mut buf).is_err());
    }

    #[rstest]
    fn test_registry_renew_and_expiry() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let mut registry = HostRegistry::default();
            let id = HostId::new_random();
            let lifetime = Duration::from_secs(10);

            registry.get_or_create(id, "conduit://peer", lifetime);
            assert!(registry.expired_hosts().is_empty());

            tokio::time::sleep(Duration::from_secs(8)).await;
            registry.get_mut(&id).unwrap().renew(lifetime);

            tokio::time::sleep(Duration::from_secs(8)).await;
            assert!(registry.expired_hosts().is_empty());

            tokio::time::sleep(Duration::from_secs(3)).await;
            assert_eq!(registry.expired_hosts(), vec![id]);
        });
    }
}
