use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::ChannelConfig;
use crate::deadline::Deadline;
use crate::error::{ChannelError, ChannelResult, ErrorKind};
use crate::frame::connection_header::{ConnectionHeader, ConnectionType};
use crate::frame::labelled::{self, LabelledReader};
use crate::host::{HostId, HostRegistry, PersistentConnectionState};
use crate::manager::{ConnectionKey, ConnectionManager, ConnectionTypes};
use crate::message::{Message, MessageDispatcher};
use crate::physical::InboundSequence;
use crate::security::{self, SecurityEnvelope, SecuritySession, SessionFactory, SessionState};
use crate::shmem::connection::ShmemConnection;
use crate::shmem::ipc::{IpcNamespace, NamedSignal, RendezvousMutex};

/// Size of the small region where a connecting client leaves its proposal.
const HELLO_REGION_SIZE: usize = 512;

fn hello_region_name(address: &str) -> String {
    format!("{}.hello", address)
}
fn rendezvous_name(address: &str) -> String {
    format!("{}.rendezvous", address)
}
fn client_connected_name(address: &str) -> String {
    format!("{}.client-connected", address)
}
fn client_accepted_name(address: &str) -> String {
    format!("{}.client-accepted", address)
}

/// Stamp an envelope with the next outbound sequence and transmit it. The envelope
///  is retained until the transmission completes, so a replay after a carrier hiccup
///  resends the exact bytes.
async fn send_sequenced(
    connection: &ShmemConnection,
    envelope: &Bytes,
    deadline: Deadline,
) -> ChannelResult<()> {
    let seq = connection.core.next_outbound_sequence();
    connection.core.retain_pending(seq, envelope.clone());

    let mut buf = BytesMut::with_capacity(8 + envelope.len());
    buf.put_u64(seq);
    buf.put_slice(envelope);

    connection.send_bytes(&buf, deadline).await?;

    // the signal protocol confirms the peer's slot handover, so completion acts as
    //  the positive acknowledgment for this carrier
    connection.core.acknowledge_pending(seq);
    Ok(())
}

/// Receive the next new envelope, skipping retransmissions and failing on a
///  sequence gap.
async fn recv_sequenced(connection: &ShmemConnection, deadline: Deadline) -> ChannelResult<Bytes> {
    loop {
        let mut raw = connection.recv_bytes(deadline).await?;
        let seq = raw.try_get_u64()
            .map_err(|_| ChannelError::incorrect_data("message shorter than its sequence stamp"))?;

        match connection.core.classify_inbound(seq) {
            InboundSequence::New => {
                connection.core.mark_inbound_processed(seq, None);
                return Ok(raw);
            }
            InboundSequence::Repeated => {
                trace!("skipping retransmitted sequence {} on '{}'", seq, connection.share_name());
                continue;
            }
            InboundSequence::Desynchronized => {
                return Err(connection.core.desynchronization_error(seq));
            }
        }
    }
}

/// Drive the handshake from the initiating side until the session is established or
///  the peer reports a rejection.
async fn handshake_initiate(
    connection: &ShmemConnection,
    session: &mut Box<dyn SecuritySession>,
    deadline: Deadline,
) -> ChannelResult<()> {
    let mut outgoing = session.establish(None, true)?;

    loop {
        match outgoing {
            Some(packet) => {
                send_sequenced(connection, &security::seal_handshake(&packet), deadline).await?;
                if session.state() == SessionState::Established {
                    return Ok(());
                }
            }
            None => return Ok(()),
        }

        let reply = recv_sequenced(connection, deadline).await?;
        match security::open_envelope(session.as_ref(), reply)? {
            SecurityEnvelope::Handshake(data) => {
                outgoing = session.establish(Some(&data), true)?;
            }
            SecurityEnvelope::Payload(_) => {
                return Err(ChannelError::incorrect_data(
                    "payload received while the security session was still negotiating",
                ));
            }
        }
    }
}

/// Drive the handshake from the accepting side. A rejection is reported to the peer
///  as a failure frame instead of truncating the stream.
async fn handshake_accept(
    connection: &ShmemConnection,
    session: &mut Box<dyn SecuritySession>,
    deadline: Deadline,
) -> ChannelResult<()> {
    loop {
        if session.state() == SessionState::Established {
            return Ok(());
        }

        let incoming = recv_sequenced(connection, deadline).await?;
        let data = match security::open_envelope(session.as_ref(), incoming)? {
            SecurityEnvelope::Handshake(data) => data,
            SecurityEnvelope::Payload(_) => {
                return Err(ChannelError::incorrect_data(
                    "payload received while the security session was still negotiating",
                ));
            }
        };

        match session.establish(Some(&data), true) {
            Ok(Some(packet)) => {
                send_sequenced(connection, &security::seal_handshake(&packet), deadline).await?;
            }
            Ok(None) => {}
            Err(e) => {
                let _ = send_sequenced(connection, &security::seal_handshake_failure(&e), deadline)
                    .await;
                return Err(e);
            }
        }
    }
}

/// One logical connection over a shared-memory region: the physical connection, the
///  security session, and the receive task feeding the dispatcher.
struct ShmemChannel {
    key: ConnectionKey,
    connection_type: ConnectionType,
    connection: Arc<ShmemConnection>,
    session: Mutex<Box<dyn SecuritySession>>,
    closed: AtomicBool,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl ShmemChannel {
    fn new(
        key: ConnectionKey,
        connection_type: ConnectionType,
        connection: Arc<ShmemConnection>,
        session: Box<dyn SecuritySession>,
    ) -> Arc<ShmemChannel> {
        Arc::new(ShmemChannel {
            key,
            connection_type,
            connection,
            session: Mutex::new(session),
            closed: AtomicBool::new(false),
            recv_task: Mutex::new(None),
        })
    }

    /// Seal application content into a security envelope and transmit it.
    async fn send_payload(&self, content: &[u8], deadline: Deadline) -> ChannelResult<()> {
        let labelled = labelled::encode([content]).freeze();
        let envelope = {
            let session = self.session.lock().unwrap();
            security::seal_payload(session.as_ref(), &labelled)?
        };
        send_sequenced(&self.connection, &envelope, deadline).await
    }

    /// A ping is an empty labelled sequence - it renews activity on both sides and
    ///  dispatches nothing.
    async fn send_ping(&self, deadline: Deadline) -> ChannelResult<()> {
        let labelled = labelled::encode(std::iter::empty::<&[u8]>()).freeze();
        let envelope = {
            let session = self.session.lock().unwrap();
            security::seal_payload(session.as_ref(), &labelled)?
        };
        send_sequenced(&self.connection, &envelope, deadline).await
    }

    /// Fires at most once regardless of how many teardown paths race.
    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            "closing shared-memory connection to {} ('{:?}'): {}",
            self.key.host, self.key.connection_name, reason
        );
        let _ = self.connection.close();
        if let Some(task) = self.recv_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct ListenerHandle {
    stop: Arc<AtomicBool>,
    client_connected: Arc<dyn NamedSignal>,
    task: JoinHandle<()>,
}

struct ManagerState {
    hosts: HostRegistry,
    channels: FxHashMap<ConnectionKey, Arc<ShmemChannel>>,
    listeners: FxHashMap<String, ListenerHandle>,
}

/// Connection manager for the shared-memory carrier.
///
/// Connecting side: [ShmemConnectionManager::connect] rendezvouses with a listener,
///  creates a fresh region, and runs the header exchange plus security handshake.
/// Listening side: [ConnectionManager::start_listening] runs an acceptor loop that
///  queues each accept onto a worker task, so a slow handshake never blocks
///  subsequent accepts.
pub struct ShmemConnectionManager {
    config: Arc<ChannelConfig>,
    namespace: Arc<dyn IpcNamespace>,
    dispatcher: Arc<dyn MessageDispatcher>,
    session_factory: SessionFactory,
    self_host_id: HostId,
    self_ref: Weak<ShmemConnectionManager>,
    state: Mutex<ManagerState>,
    keeper_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ShmemConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.keeper_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl ShmemConnectionManager {
    /// Must be called from within a tokio runtime - the keeper task starts
    ///  immediately.
    pub fn new(
        config: Arc<ChannelConfig>,
        namespace: Arc<dyn IpcNamespace>,
        dispatcher: Arc<dyn MessageDispatcher>,
        session_factory: SessionFactory,
    ) -> ChannelResult<Arc<ShmemConnectionManager>> {
        config.validate()?;

        let manager = Arc::new_cyclic(|weak| ShmemConnectionManager {
            config,
            namespace,
            dispatcher,
            session_factory,
            self_host_id: HostId::new_random(),
            self_ref: weak.clone(),
            state: Mutex::new(ManagerState {
                hosts: HostRegistry::default(),
                channels: FxHashMap::default(),
                listeners: FxHashMap::default(),
            }),
            keeper_task: Mutex::new(None),
        });

        manager.spawn_keeper();
        Ok(manager)
    }

    pub fn self_host_id(&self) -> HostId {
        self.self_host_id
    }

    fn self_arc(&self) -> ChannelResult<Arc<ShmemConnectionManager>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| ChannelError::logic("connection manager is shutting down"))
    }

    /// Establish a connection to a listener and return the peer's host id for
    ///  subsequent sends.
    pub async fn connect(
        &self,
        address: &str,
        connection_name: Option<String>,
    ) -> ChannelResult<HostId> {
        let deadline = Deadline::after(self.config.connect_timeout);

        // the rendezvous mutex serializes competing clients on this listener
        let mutex = self.namespace.rendezvous_mutex(&rendezvous_name(address))?;
        let guard = mutex.lock(deadline).await?;

        let share_name = format!("{}.conn.{}", address, Uuid::new_v4());
        let connection = Arc::new(ShmemConnection::create(
            self.namespace.as_ref(),
            &share_name,
            self.config.shmem_region_size,
            self.config.max_packet_size,
        )?);

        // leave the proposal in the hello region and wake the acceptor
        let hello = self.namespace.open_region(&hello_region_name(address))
            .map_err(|_| ChannelError::DestinationUnreachable {
                host: address.to_string(),
                detail: format!("no listener on '{}'", address),
            })?;
        let mut proposal = BytesMut::new();
        proposal.put_u8(ConnectionHeader::PROTOCOL_VERSION_1);
        proposal.put_u16(share_name.len() as u16);
        proposal.put_slice(share_name.as_bytes());
        if proposal.len() > HELLO_REGION_SIZE {
            return Err(ChannelError::TooLarge {
                size: proposal.len(),
                limit: HELLO_REGION_SIZE,
            });
        }
        hello.write(0, &proposal)?;

        self.namespace.signal(&client_connected_name(address))?.set();
        self.namespace.signal(&client_accepted_name(address))?.wait(deadline).await?;
        // the listener adopted the region - the hello slot is free for the next client
        drop(guard);

        // header exchange: the connecting side sends first
        let mut header_buf = BytesMut::new();
        ConnectionHeader::new(ConnectionType::Persistent, self.self_host_id, connection_name.clone())
            .ser(&mut header_buf);
        send_sequenced(&connection, &header_buf.freeze(), deadline).await?;

        let mut peer_header_raw = recv_sequenced(&connection, deadline).await?;
        let peer_header = ConnectionHeader::deser(&mut peer_header_raw)?;
        let peer_id = peer_header.host_id;

        let mut session = (self.session_factory)();
        handshake_initiate(&connection, &mut session, deadline).await?;

        let channel = ShmemChannel::new(
            ConnectionKey::new(peer_id, connection_name),
            ConnectionType::Persistent,
            connection,
            session,
        );

        {
            let mut state = self.state.lock().unwrap();
            let lifetime = self.config.close_after_inactivity;
            let host = state.hosts.get_or_create(peer_id, &format!("shmem://{}", address), lifetime);
            host.connection_state = PersistentConnectionState::Opened;
            if !host.urls.contains(&address.to_string()) {
                host.urls.push(address.to_string());
            }
            if let Some(old) = state.channels.insert(channel.key.clone(), channel.clone()) {
                old.close("superseded by a new connection to the same peer");
            }
        }

        self.spawn_recv_loop(channel)?;
        info!("connected to {} via shared memory at '{}'", peer_id, address);
        Ok(peer_id)
    }

    fn spawn_recv_loop(&self, channel: Arc<ShmemChannel>) -> ChannelResult<()> {
        let manager = self.self_arc()?;
        let task_channel = channel.clone();
        let task = tokio::spawn(async move {
            manager.recv_loop(task_channel).await;
        });
        *channel.recv_task.lock().unwrap() = Some(task);
        Ok(())
    }

    async fn recv_loop(self: Arc<Self>, channel: Arc<ShmemChannel>) {
        loop {
            if channel.is_closed() {
                return;
            }

            // bounded wait per iteration; an uneventful interval just loops
            let deadline = Deadline::after(self.config.keeper_interval);
            let raw = match recv_sequenced(&channel.connection, deadline).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::Timeout => continue,
                Err(e) => {
                    self.handle_connection_failure(&channel, e);
                    return;
                }
            };

            let envelope = {
                let session = channel.session.lock().unwrap();
                security::open_envelope(session.as_ref(), raw)
            };
            match envelope {
                Ok(SecurityEnvelope::Payload(plain)) => {
                    self.renew_host(&channel.key.host);
                    if let Err(e) = self.dispatch_payload(&channel, plain).await {
                        warn!("dropping malformed packet from {}: {}", channel.key.host, e);
                    }
                }
                Ok(SecurityEnvelope::Handshake(data)) => {
                    // a retransmitted handshake packet after establishment is a no-op
                    let result = channel.session.lock().unwrap().establish(Some(&data), true);
                    if let Err(e) = result {
                        self.handle_connection_failure(&channel, e);
                        return;
                    }
                }
                Err(e) => {
                    self.handle_connection_failure(&channel, e);
                    return;
                }
            }
        }
    }

    async fn dispatch_payload(&self, channel: &Arc<ShmemChannel>, plain: Bytes) -> ChannelResult<()> {
        let mut reader = LabelledReader::new(plain);
        let entries = reader.read_all()?;
        if entries.is_empty() {
            trace!("ping from {}", channel.key.host);
            return Ok(());
        }
        for entry in entries {
            self.dispatcher
                .handle_message(
                    entry,
                    channel.key.host,
                    channel.connection_type,
                    channel.key.connection_name.clone(),
                    true,
                )
                .await;
        }
        Ok(())
    }

    fn handle_connection_failure(&self, channel: &Arc<ShmemChannel>, error: ChannelError) {
        if channel.is_closed() {
            return;
        }
        if error.is_critical() {
            warn!(
                "critical failure on connection to {}: {} ({})",
                channel.key.host,
                error,
                error.identifier()
            );
        }
        else {
            debug!("connection to {} failed: {}", channel.key.host, error);
        }

        // the shared-memory region dies with its connection, so reestablishment means
        //  a fresh connect - it benefits the next send, not the failed one
        channel.close(&error.to_string());
        let mut state = self.state.lock().unwrap();
        state.channels.remove(&channel.key);
        if error.is_critical() {
            state.hosts.remove(&channel.key.host);
        }
    }

    fn renew_host(&self, host: &HostId) {
        let mut state = self.state.lock().unwrap();
        let lifetime = self.config.close_after_inactivity;
        if let Some(host) = state.hosts.get_mut(host) {
            host.renew(lifetime);
        }
    }

    fn spawn_keeper(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        let interval = self.config.keeper_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                manager.keeper_tick().await;
            }
        });
        *self.keeper_task.lock().unwrap() = Some(task);
    }

    /// Close connections idle past the inactivity timeout; ping the ones merely
    ///  resting. A failed ping is logged and the inactivity timeout still governs
    ///  teardown, so ping failures cannot start a reconnection storm.
    async fn keeper_tick(self: &Arc<Self>) {
        let (to_close, to_ping) = {
            let state = self.state.lock().unwrap();
            let mut to_close = Vec::new();
            let mut to_ping = Vec::new();
            for channel in state.channels.values() {
                let idle = channel.connection.core.idle_for();
                if idle >= self.config.close_after_inactivity {
                    to_close.push(channel.clone());
                }
                else if idle >= self.config.ping_after_inactivity {
                    to_ping.push(channel.clone());
                }
            }
            (to_close, to_ping)
        };

        for channel in to_close {
            debug!("closing connection to {} after inactivity", channel.key.host);
            channel.close("inactivity timeout");
            self.state.lock().unwrap().channels.remove(&channel.key);
        }

        for channel in to_ping {
            let guard = match channel.connection.core.acquire_if_available() {
                Ok(guard) => guard,
                Err(_) => continue, // busy sending, which is activity enough
            };
            let deadline = Deadline::after(self.config.send_timeout);
            if let Err(e) = channel.send_ping(deadline).await {
                debug!("ping to {} failed: {}", channel.key.host, e);
            }
            drop(guard);
        }

        let expired = {
            let state = self.state.lock().unwrap();
            state.hosts.expired_hosts()
        };
        for host in expired {
            self.release_connections(Some(host), ConnectionTypes::all(), "host expired").await;
            self.state.lock().unwrap().hosts.remove(&host);
        }
    }

    async fn accept_one(self: Arc<Self>, share_name: String) -> ChannelResult<()> {
        let deadline = Deadline::after(self.config.connect_timeout);

        let connection = Arc::new(ShmemConnection::open(
            self.namespace.as_ref(),
            &share_name,
            self.config.max_packet_size,
        )?);

        // the connecting side sends its header first, then expects ours
        let mut peer_header_raw = recv_sequenced(&connection, deadline).await?;
        let peer_header = ConnectionHeader::deser(&mut peer_header_raw)?;

        let mut header_buf = BytesMut::new();
        ConnectionHeader::new(
            ConnectionType::Persistent,
            self.self_host_id,
            peer_header.connection_name.clone(),
        )
        .ser(&mut header_buf);
        send_sequenced(&connection, &header_buf.freeze(), deadline).await?;

        let mut session = (self.session_factory)();
        handshake_accept(&connection, &mut session, deadline).await?;

        let channel = ShmemChannel::new(
            ConnectionKey::new(peer_header.host_id, peer_header.connection_name.clone()),
            peer_header.connection_type,
            connection,
            session,
        );

        {
            let mut state = self.state.lock().unwrap();
            let lifetime = self.config.close_after_inactivity;
            let host = state.hosts.get_or_create(
                peer_header.host_id,
                &format!("shmem://{}", peer_header.host_id),
                lifetime,
            );
            host.connection_state = PersistentConnectionState::Accepted;
            if let Some(old) = state.channels.insert(channel.key.clone(), channel.clone()) {
                old.close("superseded by a new connection from the same peer");
            }
        }

        self.spawn_recv_loop(channel)?;
        info!("accepted shared-memory connection from {}", peer_header.host_id);
        Ok(())
    }

    async fn acceptor_loop(
        self: Arc<Self>,
        address: String,
        stop: Arc<AtomicBool>,
        client_connected: Arc<dyn NamedSignal>,
    ) {
        info!("listening for shared-memory connections on '{}'", address);
        loop {
            // bounded wait so the stop flag is observed even without traffic
            let wait = client_connected.wait(Deadline::after(self.config.keeper_interval)).await;
            if stop.load(Ordering::Acquire) {
                info!("stopped listening on '{}'", address);
                return;
            }
            match wait {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Timeout => continue,
                Err(e) => {
                    warn!("acceptor wait on '{}' failed: {}", address, e);
                    return;
                }
            }

            let share_name = match self.read_hello(&address) {
                Ok(share_name) => share_name,
                Err(e) => {
                    warn!("rejecting malformed connection proposal on '{}': {}", address, e);
                    continue;
                }
            };

            // confirm adoption while the client still holds the rendezvous, then queue
            //  the handshake work so the loop returns to waiting immediately
            match self.namespace.signal(&client_accepted_name(&address)) {
                Ok(accepted) => accepted.set(),
                Err(e) => {
                    warn!("acceptor on '{}' lost its signal: {}", address, e);
                    return;
                }
            }

            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.accept_one(share_name.clone()).await {
                    warn!("accept of '{}' failed: {} ({})", share_name, e, e.identifier());
                }
            });
        }
    }

    fn read_hello(&self, address: &str) -> ChannelResult<String> {
        let hello = self.namespace.open_region(&hello_region_name(address))?;

        let mut head = [0u8; 3];
        hello.read(0, &mut head)?;
        let version = head[0];
        if version != ConnectionHeader::PROTOCOL_VERSION_1 {
            return Err(ChannelError::IncorrectData {
                detail: format!("unsupported protocol version {} in connection proposal", version),
            });
        }

        let name_len = u16::from_be_bytes([head[1], head[2]]) as usize;
        if name_len == 0 || name_len > HELLO_REGION_SIZE - 3 {
            return Err(ChannelError::incorrect_data("implausible share name length in proposal"));
        }
        let mut name_bytes = vec![0u8; name_len];
        hello.read(3, &mut name_bytes)?;

        String::from_utf8(name_bytes)
            .map_err(|_| ChannelError::incorrect_data("share name is not valid UTF-8"))
    }
}

#[async_trait]
impl ConnectionManager for ShmemConnectionManager {
    async fn send(&self, message: Message) -> ChannelResult<()> {
        message.deadline.check("send")?;

        let key = ConnectionKey::new(message.to, message.connection_name.clone());
        let channel = {
            let state = self.state.lock().unwrap();
            state.channels.get(&key).cloned()
        };
        let Some(channel) = channel else {
            return Err(ChannelError::DestinationUnreachable {
                host: message.to.to_string(),
                detail: "no established shared-memory connection".to_string(),
            });
        };

        let result = async {
            let _guard = channel.connection.core.acquire_within(message.deadline).await?;
            channel.send_payload(&message.content, message.deadline).await
        }
        .await;

        match result {
            Ok(()) => {
                self.renew_host(&message.to);
                Ok(())
            }
            Err(e) => {
                self.handle_connection_failure(&channel, e.clone());
                if !message.one_way {
                    self.dispatcher.dispatch_failure(message, e.clone()).await;
                }
                Err(e)
            }
        }
    }

    async fn release_connections(
        &self,
        host: Option<HostId>,
        mask: ConnectionTypes,
        reason: &str,
    ) {
        let victims: Vec<Arc<ShmemChannel>> = {
            let mut state = self.state.lock().unwrap();
            let keys: Vec<ConnectionKey> = state
                .channels
                .iter()
                .filter(|(key, channel)| {
                    host.map_or(true, |h| key.host == h) && mask.matches(channel.connection_type)
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| state.channels.remove(&key))
                .collect()
        };

        for channel in victims {
            // close() fires at most once, so a racing teardown cannot double-report
            channel.close(reason);
        }
    }

    async fn start_listening(&self, address: &str) -> ChannelResult<()> {
        let manager = self.self_arc()?;

        let mut state = self.state.lock().unwrap();
        if state.listeners.contains_key(address) {
            return Err(ChannelError::LogicError {
                detail: format!("already listening on '{}'", address),
            });
        }

        self.namespace.create_region(&hello_region_name(address), HELLO_REGION_SIZE)?;
        let client_connected = self.namespace.signal(&client_connected_name(address))?;
        let stop = Arc::new(AtomicBool::new(false));

        let task = {
            let address = address.to_string();
            let stop = stop.clone();
            let client_connected = client_connected.clone();
            tokio::spawn(async move {
                manager.acceptor_loop(address, stop, client_connected).await;
            })
        };

        state.listeners.insert(
            address.to_string(),
            ListenerHandle {
                stop,
                client_connected,
                task,
            },
        );
        Ok(())
    }

    async fn stop_listening(&self, address: &str) -> ChannelResult<()> {
        let handle = {
            let mut state = self.state.lock().unwrap();
            state.listeners.remove(address)
        };
        let Some(handle) = handle else {
            return Err(ChannelError::LogicError {
                detail: format!("not listening on '{}'", address),
            });
        };

        // the acceptor checks the flag on every wake, including wakes it shares with
        //  a connecting client
        handle.stop.store(true, Ordering::Release);
        handle.client_connected.set();
        let _ = handle.task.await;

        self.namespace.remove_prefix(&hello_region_name(address));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::security::{AesGcmSession, NoSecurity};
    use crate::shmem::ipc::InProcessNamespace;
    use rstest::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct RecordingDispatcher {
        received: mpsc::UnboundedSender<(Bytes, HostId)>,
        failures: mpsc::UnboundedSender<(Message, ChannelError)>,
    }

    #[async_trait]
    impl MessageDispatcher for RecordingDispatcher {
        async fn handle_message(
            &self,
            content: Bytes,
            from: HostId,
            _connection_type: ConnectionType,
            _connection_name: Option<String>,
            _one_way: bool,
        ) {
            let _ = self.received.send((content, from));
        }

        async fn dispatch_failure(&self, message: Message, error: ChannelError) {
            let _ = self.failures.send((message, error));
        }
    }

    struct TestPeer {
        manager: Arc<ShmemConnectionManager>,
        received: mpsc::UnboundedReceiver<(Bytes, HostId)>,
        #[allow(dead_code)]
        failures: mpsc::UnboundedReceiver<(Message, ChannelError)>,
    }

    fn peer(namespace: &Arc<InProcessNamespace>, sessions: SessionFactory) -> TestPeer {
        let (received_send, received) = mpsc::unbounded_channel();
        let (failures_send, failures) = mpsc::unbounded_channel();
        let manager = ShmemConnectionManager::new(
            Arc::new(default_config()),
            namespace.clone() as Arc<dyn IpcNamespace>,
            Arc::new(RecordingDispatcher {
                received: received_send,
                failures: failures_send,
            }),
            sessions,
        )
        .unwrap();
        TestPeer {
            manager,
            received,
            failures,
        }
    }

    fn no_security() -> SessionFactory {
        Arc::new(|| Box::new(NoSecurity))
    }

    fn aes_sessions(key: [u8; 32]) -> SessionFactory {
        Arc::new(move || Box::new(AesGcmSession::new(&key)))
    }

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_connect_and_send_end_to_end() {
        rt().block_on(async {
            let ns = Arc::new(InProcessNamespace::new());
            let mut server = peer(&ns, no_security());
            let client = peer(&ns, no_security());

            server.manager.start_listening("svc").await.unwrap();
            let server_id = client.manager.connect("svc", None).await.unwrap();
            assert_eq!(server_id, server.manager.self_host_id());

            client.manager
                .send(Message::new(server_id, Bytes::from_static(b"first"), Deadline::after(Duration::from_secs(5))))
                .await.unwrap();
            client.manager
                .send(Message::new(server_id, Bytes::from_static(b"second"), Deadline::after(Duration::from_secs(5))))
                .await.unwrap();

            let (content, from) = server.received.recv().await.unwrap();
            assert_eq!(content.as_ref(), b"first");
            assert_eq!(from, client.manager.self_host_id());

            let (content, _) = server.received.recv().await.unwrap();
            assert_eq!(content.as_ref(), b"second");
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_server_can_send_back() {
        rt().block_on(async {
            let ns = Arc::new(InProcessNamespace::new());
            let server = peer(&ns, no_security());
            let mut client = peer(&ns, no_security());

            server.manager.start_listening("svc").await.unwrap();
            client.manager.connect("svc", None).await.unwrap();

            // the accept runs on a worker task - wait until the server knows the client
            let client_id = client.manager.self_host_id();
            let mut attempts = 0;
            loop {
                let result = server.manager
                    .send(Message::new(client_id, Bytes::from_static(b"reply"), Deadline::after(Duration::from_secs(5))))
                    .await;
                match result {
                    Ok(()) => break,
                    Err(e) if e.kind() == ErrorKind::DestinationUnreachable && attempts < 100 => {
                        attempts += 1;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Err(e) => panic!("send failed: {}", e),
                }
            }

            let (content, from) = client.received.recv().await.unwrap();
            assert_eq!(content.as_ref(), b"reply");
            assert_eq!(from, server.manager.self_host_id());
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_encrypted_end_to_end() {
        rt().block_on(async {
            let ns = Arc::new(InProcessNamespace::new());
            let key = [42u8; 32];
            let mut server = peer(&ns, aes_sessions(key));
            let client = peer(&ns, aes_sessions(key));

            server.manager.start_listening("secure").await.unwrap();
            let server_id = client.manager.connect("secure", None).await.unwrap();

            client.manager
                .send(Message::new(server_id, Bytes::from_static(b"secret"), Deadline::after(Duration::from_secs(5))))
                .await.unwrap();

            let (content, _) = server.received.recv().await.unwrap();
            assert_eq!(content.as_ref(), b"secret");
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_send_to_unknown_host_is_unreachable() {
        rt().block_on(async {
            let ns = Arc::new(InProcessNamespace::new());
            let client = peer(&ns, no_security());

            let err = client.manager
                .send(Message::new(
                    HostId::from_bytes([9; 16]),
                    Bytes::from_static(b"void"),
                    Deadline::after(Duration::from_secs(1)),
                ))
                .await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DestinationUnreachable);
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_connect_without_listener_fails() {
        rt().block_on(async {
            let ns = Arc::new(InProcessNamespace::new());
            let client = peer(&ns, no_security());

            let err = client.manager.connect("nobody-home", None).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DestinationUnreachable);
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_duplicate_listen_rejected() {
        rt().block_on(async {
            let ns = Arc::new(InProcessNamespace::new());
            let server = peer(&ns, no_security());

            server.manager.start_listening("svc").await.unwrap();
            let err = server.manager.start_listening("svc").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::LogicError);
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_stop_listening_rejects_new_connects() {
        rt().block_on(async {
            let ns = Arc::new(InProcessNamespace::new());
            let server = peer(&ns, no_security());
            let client = peer(&ns, no_security());

            server.manager.start_listening("svc").await.unwrap();
            server.manager.stop_listening("svc").await.unwrap();

            let err = client.manager.connect("svc", None).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DestinationUnreachable);

            // stopping twice reports the inconsistency
            let err = server.manager.stop_listening("svc").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::LogicError);
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_release_connections_then_send_fails() {
        rt().block_on(async {
            let ns = Arc::new(InProcessNamespace::new());
            let server = peer(&ns, no_security());
            let client = peer(&ns, no_security());

            server.manager.start_listening("svc").await.unwrap();
            let server_id = client.manager.connect("svc", None).await.unwrap();

            client.manager
                .release_connections(Some(server_id), ConnectionTypes::all(), "test teardown")
                .await;
            // releasing again is a no-op
            client.manager
                .release_connections(Some(server_id), ConnectionTypes::all(), "test teardown")
                .await;

            let err = client.manager
                .send(Message::new(server_id, Bytes::from_static(b"late"), Deadline::after(Duration::from_secs(1))))
                .await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DestinationUnreachable);
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_named_connections_are_independent() {
        rt().block_on(async {
            let ns = Arc::new(InProcessNamespace::new());
            let mut server = peer(&ns, no_security());
            let client = peer(&ns, no_security());

            server.manager.start_listening("svc").await.unwrap();
            let id_a = client.manager.connect("svc", Some("a".to_string())).await.unwrap();
            let id_b = client.manager.connect("svc", Some("b".to_string())).await.unwrap();
            assert_eq!(id_a, id_b);

            client.manager
                .send(
                    Message::new(id_a, Bytes::from_static(b"via-a"), Deadline::after(Duration::from_secs(5)))
                        .with_connection_name("a"),
                )
                .await.unwrap();
            client.manager
                .send(
                    Message::new(id_b, Bytes::from_static(b"via-b"), Deadline::after(Duration::from_secs(5)))
                        .with_connection_name("b"),
                )
                .await.unwrap();

            let mut contents = vec![
                server.received.recv().await.unwrap().0,
                server.received.recv().await.unwrap().0,
            ];
            contents.sort();
            assert_eq!(contents[0].as_ref(), b"via-a");
            assert_eq!(contents[1].as_ref(), b"via-b");
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_elapsed_deadline_fails_before_carrier() {
        rt().block_on(async {
            let ns = Arc::new(InProcessNamespace::new());
            let server = peer(&ns, no_security());
            let client = peer(&ns, no_security());

            server.manager.start_listening("svc").await.unwrap();
            let server_id = client.manager.connect("svc", None).await.unwrap();

            let err = client.manager
                .send(Message::new(server_id, Bytes::from_static(b"x"), Deadline::after(Duration::ZERO)))
                .await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Timeout);
        });
    }
}
