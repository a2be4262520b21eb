use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::ChannelConfig;
use crate::deadline::Deadline;
use crate::error::{ChannelError, ChannelResult};
use crate::frame::connection_header::ConnectionType;
use crate::frame::labelled::{self, LabelledReader};
use crate::host::{HostId, HostRegistry, PersistentConnectionState};
use crate::http::packet::{HttpPacketType, TunnelPacket};
use crate::http::wire;
use crate::manager::{ConnectionKey, ConnectionManager, ConnectionTypes};
use crate::message::{Message, MessageDispatcher};
use crate::physical::{InboundSequence, PhysicalCore};
use crate::security::{self, SecurityEnvelope, SecuritySession, SessionFactory};

/// Server-side state of one tunnelled connection: the sequence discipline for the
///  client's sender requests, the security session, and the outbound queue drained
///  by the client's listener polls.
struct HttpServerChannel {
    key: ConnectionKey,
    connection_type: ConnectionType,
    core: PhysicalCore,
    session: Mutex<Box<dyn SecuritySession>>,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    queued_bytes: AtomicUsize,
    /// bumped by every arriving listener poll; a held poll that observes a newer
    ///  generation yields with a conflict so exactly one poll is held per connection
    poll_generation: AtomicU64,
    poll_wakeup: Notify,
    closed: AtomicBool,
}

impl HttpServerChannel {
    fn new(key: ConnectionKey, connection_type: ConnectionType, session: Box<dyn SecuritySession>) -> Arc<HttpServerChannel> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(HttpServerChannel {
            key,
            connection_type,
            core: PhysicalCore::new(),
            session: Mutex::new(session),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            queued_bytes: AtomicUsize::new(0),
            poll_generation: AtomicU64::new(0),
            poll_wakeup: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            "closing tunnelled connection to {} ('{:?}'): {}",
            self.key.host, self.key.connection_name, reason
        );
        self.core.dispose();
        // a held listener poll wakes and observes the closed flag
        self.poll_wakeup.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn enqueue(&self, envelope: Bytes, limit: usize) -> ChannelResult<()> {
        let queued = self.queued_bytes.load(Ordering::Acquire);
        if queued + envelope.len() > limit {
            return Err(ChannelError::QueueOverloaded {
                queued_bytes: queued + envelope.len(),
                limit_bytes: limit,
            });
        }
        self.queued_bytes.fetch_add(envelope.len(), Ordering::AcqRel);
        self.outbound_tx
            .send(envelope)
            .map_err(|_| ChannelError::closed("outbound queue was torn down"))
    }
}

struct ListenerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

struct ServerState {
    hosts: HostRegistry,
    channels: FxHashMap<ConnectionKey, Arc<HttpServerChannel>>,
    listeners: FxHashMap<String, ListenerHandle>,
}

/// The answering side of the HTTP tunnel. Binds plain TCP listeners, parses tunnel
///  requests, and answers each request according to its packet type; outbound
///  messages ride on the client's held listener polls.
pub struct HttpServerConnectionManager {
    config: Arc<ChannelConfig>,
    dispatcher: Arc<dyn MessageDispatcher>,
    session_factory: SessionFactory,
    self_host_id: HostId,
    self_ref: Weak<HttpServerConnectionManager>,
    state: Mutex<ServerState>,
    keeper_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for HttpServerConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.keeper_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl HttpServerConnectionManager {
    /// Must be called from within a tokio runtime - the keeper task starts
    ///  immediately.
    pub fn new(
        config: Arc<ChannelConfig>,
        dispatcher: Arc<dyn MessageDispatcher>,
        session_factory: SessionFactory,
    ) -> ChannelResult<Arc<HttpServerConnectionManager>> {
        config.validate()?;

        let manager = Arc::new_cyclic(|weak| HttpServerConnectionManager {
            config,
            dispatcher,
            session_factory,
            self_host_id: HostId::new_random(),
            self_ref: weak.clone(),
            state: Mutex::new(ServerState {
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

    /// The socket address a listener actually bound, for `port 0` style addresses.
    pub fn local_addr(&self, address: &str) -> Option<SocketAddr> {
        self.state.lock().unwrap().listeners.get(address).map(|h| h.local_addr)
    }

    fn self_arc(&self) -> ChannelResult<Arc<HttpServerConnectionManager>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| ChannelError::logic("connection manager is shutting down"))
    }

    fn channel(&self, key: &ConnectionKey) -> Option<Arc<HttpServerChannel>> {
        self.state.lock().unwrap().channels.get(key).cloned()
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
                manager.keeper_tick();
            }
        });
        *self.keeper_task.lock().unwrap() = Some(task);
    }

    /// Drop connections whose client went silent. The client's listener polls count
    ///  as activity, so a healthy but quiet client is never dropped.
    fn keeper_tick(self: &Arc<Self>) {
        let stale: Vec<Arc<HttpServerChannel>> = {
            let state = self.state.lock().unwrap();
            state
                .channels
                .values()
                .filter(|c| c.core.idle_for() >= self.config.close_after_inactivity)
                .cloned()
                .collect()
        };
        for channel in stale {
            channel.close("inactivity timeout");
            self.state.lock().unwrap().channels.remove(&channel.key);
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, address: String) {
        info!("listening for tunnel connections on '{}'", address);
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept on '{}' failed: {}", address, e);
                    continue;
                }
            };
            trace!("accepted tunnel socket from {}", peer);

            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.serve_socket(socket).await {
                    // sockets come and go; the logical connections outlive them
                    debug!("tunnel socket from {} ended: {}", peer, e);
                }
            });
        }
    }

    /// Serve keep-alive request/response exchanges on one socket until the client
    ///  drops it or goes idle past the inactivity bound.
    async fn serve_socket(self: Arc<Self>, socket: TcpStream) -> ChannelResult<()> {
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);

        loop {
            let deadline = Deadline::after(self.config.close_after_inactivity);
            let head = wire::read_head(&mut reader, deadline).await?;
            if !head.is_post_to_tunnel() {
                wire::write_response_head(&mut write_half, 404, "Not Found", 0).await?;
                write_half.flush().await
                    .map_err(|e| ChannelError::from_io("flush http response", e))?;
                continue;
            }
            if head.expects_continue() {
                wire::write_continue(&mut write_half).await?;
            }

            let body_deadline = Deadline::after(self.config.send_timeout);
            let body = wire::read_body(
                &mut reader,
                head.content_length()?,
                self.config.max_packet_size,
                body_deadline,
            )
            .await?;

            let (status, reason, response_body) = match TunnelPacket::deser(body) {
                Ok(packet) => self.handle_packet(packet).await,
                Err(e) => {
                    warn!("rejecting malformed tunnel packet: {}", e);
                    (400, "Bad Request", Bytes::new())
                }
            };

            wire::write_response_head(&mut write_half, status, reason, response_body.len()).await?;
            write_half.write_all(&response_body).await
                .map_err(|e| ChannelError::from_io("write http response body", e))?;
            write_half.flush().await
                .map_err(|e| ChannelError::from_io("flush http response", e))?;
        }
    }

    async fn handle_packet(self: &Arc<Self>, packet: TunnelPacket) -> (u16, &'static str, Bytes) {
        let key = ConnectionKey::new(packet.host_id, packet.connection_name.clone());

        match packet.packet_type {
            HttpPacketType::Establishing => self.handle_establishing(packet, key, false),
            HttpPacketType::EstablishingResetConnection => {
                self.handle_establishing(packet, key, true)
            }
            HttpPacketType::Usual => self.handle_usual(packet, key).await,
            HttpPacketType::Listening => self.handle_listening(packet, key).await,
            HttpPacketType::ClosedManually => {
                if let Some(channel) = self.state.lock().unwrap().channels.remove(&key) {
                    channel.close("closed by the peer");
                }
                let reply = TunnelPacket::new(
                    HttpPacketType::ClosedManually,
                    packet.sequence,
                    self.self_host_id,
                    packet.connection_name,
                    Bytes::new(),
                );
                (200, "OK", reply.ser())
            }
            other => {
                warn!("unexpected tunnel packet type {:?} on the answering side", other);
                self.sender_error(
                    &packet,
                    &ChannelError::IncorrectData {
                        detail: format!("packet type {:?} is not valid in a request", other),
                    },
                )
            }
        }
    }

    /// Establishment exchange: create (or on reset, replace) the connection state and
    ///  run one security handshake step. An empty payload carries no handshake data.
    fn handle_establishing(
        self: &Arc<Self>,
        packet: TunnelPacket,
        key: ConnectionKey,
        reset: bool,
    ) -> (u16, &'static str, Bytes) {
        let channel = {
            let mut state = self.state.lock().unwrap();
            let lifetime = self.config.close_after_inactivity;
            let host = state.hosts.get_or_create(
                packet.host_id,
                &format!("http://{}", packet.host_id),
                lifetime,
            );
            host.connection_state = PersistentConnectionState::Accepted;
            host.renew(lifetime);

            if reset {
                if let Some(old) = state.channels.remove(&key) {
                    old.close("reset by the peer");
                }
            }
            state
                .channels
                .entry(key.clone())
                .or_insert_with(|| {
                    HttpServerChannel::new(key.clone(), ConnectionType::Persistent, (self.session_factory)())
                })
                .clone()
        };
        channel.core.renew();

        if packet.payload.is_empty() {
            let reply = TunnelPacket::new(
                HttpPacketType::Establishing,
                packet.sequence,
                self.self_host_id,
                packet.connection_name,
                Bytes::new(),
            );
            return (200, "OK", reply.ser());
        }

        let step = {
            let mut session = channel.session.lock().unwrap();
            match security::open_envelope(session.as_ref(), packet.payload.clone()) {
                Ok(SecurityEnvelope::Handshake(data)) => session.establish(Some(&data), true),
                Ok(SecurityEnvelope::Payload(_)) => Err(ChannelError::incorrect_data(
                    "payload received while the security session was still negotiating",
                )),
                Err(e) => Err(e),
            }
        };

        match step {
            Ok(outgoing) => {
                let payload = outgoing
                    .map(|p| security::seal_handshake(&p))
                    .unwrap_or_default();
                let reply = TunnelPacket::new(
                    HttpPacketType::Establishing,
                    packet.sequence,
                    self.self_host_id,
                    packet.connection_name,
                    payload,
                );
                (200, "OK", reply.ser())
            }
            Err(e) => {
                self.fail_channel(&channel, &e);
                self.sender_error(&packet, &e)
            }
        }
    }

    /// A regular message exchange: apply the sequence discipline, dispatch new
    ///  content, replay the cached response for a repeated sequence.
    async fn handle_usual(
        self: &Arc<Self>,
        packet: TunnelPacket,
        key: ConnectionKey,
    ) -> (u16, &'static str, Bytes) {
        let Some(channel) = self.channel(&key) else {
            return self.sender_error(
                &packet,
                &ChannelError::closed("no established tunnel connection"),
            );
        };

        match channel.core.classify_inbound(packet.sequence) {
            InboundSequence::Repeated => {
                // the client lost our response and replayed the request - answer with
                //  the cached bytes without reprocessing
                trace!("replaying cached response for sequence {} to {}", packet.sequence, key.host);
                let cached = channel.core.cached_response().unwrap_or_default();
                (200, "OK", cached)
            }
            InboundSequence::Desynchronized => {
                let e = channel.core.desynchronization_error(packet.sequence);
                self.fail_channel(&channel, &e);
                let reply = TunnelPacket::new(
                    HttpPacketType::Desynchronization,
                    packet.sequence,
                    self.self_host_id,
                    packet.connection_name,
                    Bytes::new(),
                );
                (200, "OK", reply.ser())
            }
            InboundSequence::New => {
                let opened = {
                    let session = channel.session.lock().unwrap();
                    security::open_envelope(session.as_ref(), packet.payload.clone())
                };
                let response = match opened {
                    Ok(SecurityEnvelope::Payload(plain)) => {
                        match self.dispatch_plain(&channel, plain).await {
                            Ok(()) => {
                                let ack = {
                                    let session = channel.session.lock().unwrap();
                                    security::seal_payload(
                                        session.as_ref(),
                                        &labelled::encode(std::iter::empty::<&[u8]>()),
                                    )
                                };
                                match ack {
                                    Ok(envelope) => {
                                        let reply = TunnelPacket::new(
                                            HttpPacketType::Usual,
                                            packet.sequence,
                                            self.self_host_id,
                                            packet.connection_name.clone(),
                                            envelope,
                                        );
                                        (200, "OK", reply.ser())
                                    }
                                    Err(e) => self.sender_error(&packet, &e),
                                }
                            }
                            Err(e) => self.sender_error(&packet, &e),
                        }
                    }
                    Ok(SecurityEnvelope::Handshake(data)) => {
                        // retransmitted handshake after establishment: idempotent no-op
                        let result = channel.session.lock().unwrap().establish(Some(&data), true);
                        match result {
                            Ok(_) => {
                                let reply = TunnelPacket::new(
                                    HttpPacketType::Usual,
                                    packet.sequence,
                                    self.self_host_id,
                                    packet.connection_name.clone(),
                                    Bytes::new(),
                                );
                                (200, "OK", reply.ser())
                            }
                            Err(e) => {
                                self.fail_channel(&channel, &e);
                                self.sender_error(&packet, &e)
                            }
                        }
                    }
                    Err(e) => {
                        self.fail_channel(&channel, &e);
                        self.sender_error(&packet, &e)
                    }
                };

                channel.core.renew();
                channel.core.mark_inbound_processed(packet.sequence, Some(response.2.clone()));
                self.renew_host(&key.host);
                response
            }
        }
    }

    /// Hold the listener poll until outbound content, the hold timeout, or a newer
    ///  poll supersedes it.
    ///
    /// The poll's sequence field is the client's acknowledgment cursor: every push
    ///  below it was processed. A pushed message is retained until a poll's cursor
    ///  moves past it; if the push's response was lost on the wire, the client's
    ///  re-poll still carries the old cursor and gets the retained bytes replayed
    ///  verbatim instead of fresh content.
    async fn handle_listening(
        self: &Arc<Self>,
        packet: TunnelPacket,
        key: ConnectionKey,
    ) -> (u16, &'static str, Bytes) {
        let Some(channel) = self.channel(&key) else {
            return self.sender_error(
                &packet,
                &ChannelError::closed("no established tunnel connection"),
            );
        };
        channel.core.renew();
        self.renew_host(&key.host);

        let my_generation = channel.poll_generation.fetch_add(1, Ordering::AcqRel) + 1;
        channel.poll_wakeup.notify_waiters();

        let mut outbound = channel.outbound_rx.lock().await;
        // register for wakeups before re-checking the generation; a supersede that
        //  fires in between would otherwise be lost
        let wakeup = channel.poll_wakeup.notified();
        tokio::pin!(wakeup);
        wakeup.as_mut().enable();

        if channel.poll_generation.load(Ordering::Acquire) != my_generation {
            // a newer poll arrived while this one waited for the slot
            return (409, "Conflict", Bytes::new());
        }
        if channel.is_closed() {
            return self.closed_reply(&packet);
        }

        if let Some(pending) = channel.core.pending_content() {
            if pending.sequence < packet.sequence {
                channel.core.acknowledge_pending(pending.sequence);
            }
            else {
                trace!("replaying push {} whose response was lost to {}", pending.sequence, key.host);
                return (200, "OK", pending.content);
            }
        }

        let hold = self.config.http_listener_hold_timeout;
        tokio::select! {
            envelope = outbound.recv() => {
                match envelope {
                    Some(envelope) => {
                        channel.queued_bytes.fetch_sub(envelope.len(), Ordering::AcqRel);
                        let reply = TunnelPacket::new(
                            HttpPacketType::Usual,
                            channel.core.next_outbound_sequence(),
                            self.self_host_id,
                            packet.connection_name,
                            envelope,
                        );
                        let body = reply.ser();
                        channel.core.retain_pending(reply.sequence, body.clone());
                        (200, "OK", body)
                    }
                    None => self.closed_reply(&packet),
                }
            }
            _ = tokio::time::sleep(hold) => {
                let reply = TunnelPacket::new(
                    HttpPacketType::ListenerTimedOut,
                    packet.sequence,
                    self.self_host_id,
                    packet.connection_name,
                    Bytes::new(),
                );
                (200, "OK", reply.ser())
            }
            _ = &mut wakeup => {
                if channel.is_closed() {
                    self.closed_reply(&packet)
                }
                else {
                    (409, "Conflict", Bytes::new())
                }
            }
        }
    }

    fn closed_reply(&self, packet: &TunnelPacket) -> (u16, &'static str, Bytes) {
        let reply = TunnelPacket::new(
            HttpPacketType::ClosedManually,
            packet.sequence,
            self.self_host_id,
            packet.connection_name.clone(),
            Bytes::new(),
        );
        (200, "OK", reply.ser())
    }

    /// Pack a failure into a `SenderError` reply so the client can distinguish a
    ///  processing rejection from a network fault.
    fn sender_error(&self, packet: &TunnelPacket, error: &ChannelError) -> (u16, &'static str, Bytes) {
        debug!("answering {} with a failure report: {}", packet.host_id, error);
        let reply = TunnelPacket::new(
            HttpPacketType::SenderError,
            packet.sequence,
            self.self_host_id,
            packet.connection_name.clone(),
            security::seal_handshake_failure(error),
        );
        (200, "OK", reply.ser())
    }

    fn fail_channel(&self, channel: &Arc<HttpServerChannel>, error: &ChannelError) {
        if error.is_critical() {
            warn!(
                "critical failure on tunnelled connection to {}: {} ({})",
                channel.key.host,
                error,
                error.identifier()
            );
            channel.close(&error.to_string());
            let mut state = self.state.lock().unwrap();
            state.channels.remove(&channel.key);
            state.hosts.remove(&channel.key.host);
        }
        else {
            debug!("tunnelled connection to {} failed: {}", channel.key.host, error);
        }
    }

    async fn dispatch_plain(&self, channel: &Arc<HttpServerChannel>, plain: Bytes) -> ChannelResult<()> {
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

    fn renew_host(&self, host: &HostId) {
        let mut state = self.state.lock().unwrap();
        let lifetime = self.config.close_after_inactivity;
        if let Some(host) = state.hosts.get_mut(host) {
            host.renew(lifetime);
        }
    }
}

#[async_trait]
impl ConnectionManager for HttpServerConnectionManager {
    /// Queue the message for the client's listener poll. The deadline bounds the
    ///  local queueing only - delivery happens whenever the client next polls.
    async fn send(&self, message: Message) -> ChannelResult<()> {
        message.deadline.check("send")?;

        let key = ConnectionKey::new(message.to, message.connection_name.clone());
        let Some(channel) = self.channel(&key) else {
            return Err(ChannelError::DestinationUnreachable {
                host: message.to.to_string(),
                detail: "no established tunnel connection".to_string(),
            });
        };

        let envelope = {
            let session = channel.session.lock().unwrap();
            security::seal_payload(session.as_ref(), &labelled::encode([&message.content[..]]))
        };
        let result = envelope.and_then(|envelope| {
            channel.enqueue(envelope, self.config.max_queue_bytes)
        });

        match result {
            Ok(()) => {
                self.renew_host(&message.to);
                Ok(())
            }
            Err(e) => {
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
        let victims: Vec<Arc<HttpServerChannel>> = {
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
            channel.close(reason);
        }
    }

    async fn start_listening(&self, address: &str) -> ChannelResult<()> {
        let manager = self.self_arc()?;

        {
            let state = self.state.lock().unwrap();
            if state.listeners.contains_key(address) {
                return Err(ChannelError::LogicError {
                    detail: format!("already listening on '{}'", address),
                });
            }
        }

        let listener = TcpListener::bind(address).await
            .map_err(|e| ChannelError::from_io("bind tunnel listener", e))?;
        let local_addr = listener.local_addr()
            .map_err(|e| ChannelError::from_io("resolve bound address", e))?;

        let task = {
            let address = address.to_string();
            tokio::spawn(async move {
                manager.accept_loop(listener, address).await;
            })
        };

        let mut state = self.state.lock().unwrap();
        if state.listeners.contains_key(address) {
            // a concurrent start won the race
            task.abort();
            return Err(ChannelError::LogicError {
                detail: format!("already listening on '{}'", address),
            });
        }
        state.listeners.insert(
            address.to_string(),
            ListenerHandle {
                local_addr,
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

        handle.task.abort();
        info!("stopped listening on '{}'", address);
        Ok(())
    }
}
