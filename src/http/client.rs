use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::ChannelConfig;
use crate::deadline::Deadline;
use crate::error::{ChannelError, ChannelResult, ErrorKind};
use crate::frame::connection_header::ConnectionType;
use crate::frame::labelled::{self, LabelledReader};
use crate::host::{HostId, HostRegistry, PersistentConnectionState};
use crate::http::packet::{HttpPacketType, TunnelPacket};
use crate::http::wire::{self, ResponseStatus};
use crate::manager::{ConnectionKey, ConnectionManager, ConnectionTypes};
use crate::message::{Message, MessageDispatcher};
use crate::physical::{InboundSequence, PhysicalCore};
use crate::security::{self, SecurityEnvelope, SecuritySession, SessionFactory, SessionState};

type SocketSlot = tokio::sync::Mutex<Option<BufReader<TcpStream>>>;

/// Client-side state of one tunnelled connection. The sender socket carries the
///  request/response exchanges of [ConnectionManager::send]; the listener loop runs
///  on its own socket so a held long poll never delays outbound traffic.
struct HttpClientChannel {
    key: ConnectionKey,
    connection_type: ConnectionType,
    address: String,
    core: PhysicalCore,
    session: Mutex<Box<dyn SecuritySession>>,
    sender_socket: SocketSlot,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl HttpClientChannel {
    /// Fires at most once regardless of how many teardown paths race.
    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            "closing tunnelled connection to {} ('{:?}'): {}",
            self.key.host, self.key.connection_name, reason
        );
        self.core.dispose();
        if let Some(task) = self.listener_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct ClientState {
    hosts: HostRegistry,
    channels: FxHashMap<ConnectionKey, Arc<HttpClientChannel>>,
}

/// The connecting side of the HTTP tunnel.
///
/// Every exchange is replayable: the serialized request is retained until the
///  response arrives, and a carrier fault replays the exact bytes over a fresh
///  socket (bounded by the reconnect limit). The answering side recognizes a
///  replayed sequence and answers from its response cache, so a message is never
///  applied twice however often the carrier fails mid-exchange.
pub struct HttpClientConnectionManager {
    config: Arc<ChannelConfig>,
    dispatcher: Arc<dyn MessageDispatcher>,
    session_factory: SessionFactory,
    self_host_id: HostId,
    self_ref: Weak<HttpClientConnectionManager>,
    state: Mutex<ClientState>,
}

impl HttpClientConnectionManager {
    pub fn new(
        config: Arc<ChannelConfig>,
        dispatcher: Arc<dyn MessageDispatcher>,
        session_factory: SessionFactory,
    ) -> ChannelResult<Arc<HttpClientConnectionManager>> {
        config.validate()?;

        Ok(Arc::new_cyclic(|weak| HttpClientConnectionManager {
            config,
            dispatcher,
            session_factory,
            self_host_id: HostId::new_random(),
            self_ref: weak.clone(),
            state: Mutex::new(ClientState {
                hosts: HostRegistry::default(),
                channels: FxHashMap::default(),
            }),
        }))
    }

    pub fn self_host_id(&self) -> HostId {
        self.self_host_id
    }

    fn self_arc(&self) -> ChannelResult<Arc<HttpClientConnectionManager>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| ChannelError::logic("connection manager is shutting down"))
    }

    /// Establish a tunnelled connection to the answering side at `address`
    ///  (`host:port`) and return its host id for subsequent sends.
    pub async fn connect(
        &self,
        address: &str,
        connection_name: Option<String>,
    ) -> ChannelResult<HostId> {
        let deadline = Deadline::after(self.config.connect_timeout);

        let sender_socket: SocketSlot = tokio::sync::Mutex::new(None);
        let core = PhysicalCore::new();
        let mut session = (self.session_factory)();

        // establishment exchanges run outside the regular sequence discipline - they
        //  are idempotent, so the answering side does not track them. The first packet
        //  requests a reset: this connection starts its sequences from zero, and any
        //  state the answering side still holds for us belongs to a previous life.
        let mut establish_seq = 0u64;
        let mut outgoing = session.establish(None, true)?;
        let mut peer_id;

        loop {
            let packet_type = if establish_seq == 0 {
                HttpPacketType::EstablishingResetConnection
            }
            else {
                HttpPacketType::Establishing
            };
            let payload = outgoing
                .take()
                .map(|p| security::seal_handshake(&p))
                .unwrap_or_default();
            let request = TunnelPacket::new(
                packet_type,
                establish_seq,
                self.self_host_id,
                connection_name.clone(),
                payload,
            )
            .ser();
            establish_seq += 1;

            let response_body = self
                .exchange_with_retry(&sender_socket, address, &request, deadline)
                .await?;
            let response = TunnelPacket::deser(response_body)?;
            peer_id = response.host_id;

            match response.packet_type {
                HttpPacketType::Establishing => {
                    if !response.payload.is_empty() {
                        match security::open_envelope(session.as_ref(), response.payload)? {
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
                HttpPacketType::SenderError => {
                    return Err(unpack_failure(response.payload));
                }
                other => {
                    return Err(ChannelError::IncorrectData {
                        detail: format!("unexpected {:?} reply to an establishment request", other),
                    });
                }
            }

            if outgoing.is_none() && session.state() == SessionState::Established {
                break;
            }
        }

        let channel = Arc::new(HttpClientChannel {
            key: ConnectionKey::new(peer_id, connection_name),
            connection_type: ConnectionType::Persistent,
            address: address.to_string(),
            core,
            session: Mutex::new(session),
            sender_socket,
            listener_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        {
            let mut state = self.state.lock().unwrap();
            let lifetime = self.config.close_after_inactivity;
            let host = state.hosts.get_or_create(peer_id, &format!("http://{}", address), lifetime);
            host.connection_state = PersistentConnectionState::Opened;
            if !host.urls.contains(&address.to_string()) {
                host.urls.push(address.to_string());
            }
            if let Some(old) = state.channels.insert(channel.key.clone(), channel.clone()) {
                old.close("superseded by a new connection to the same peer");
            }
        }

        self.spawn_listener_loop(channel)?;
        info!("connected to {} via http tunnel at '{}'", peer_id, address);
        Ok(peer_id)
    }

    /// One HTTP exchange: write the request, read the response body. A failed socket
    ///  is dropped so the next attempt starts from a fresh connection.
    async fn exchange_once(
        &self,
        slot: &SocketSlot,
        address: &str,
        body: &Bytes,
        deadline: Deadline,
    ) -> ChannelResult<Bytes> {
        let mut guard = slot.lock().await;
        let result = self.try_exchange(&mut guard, address, body, deadline).await;
        if result.is_err() {
            *guard = None;
        }
        result
    }

    async fn try_exchange(
        &self,
        socket: &mut Option<BufReader<TcpStream>>,
        address: &str,
        body: &Bytes,
        deadline: Deadline,
    ) -> ChannelResult<Bytes> {
        deadline.check("tunnel exchange")?;

        if socket.is_none() {
            let stream = deadline
                .run("connect tunnel socket", async {
                    TcpStream::connect(address).await
                        .map_err(|e| ChannelError::from_io("connect tunnel socket", e))
                })
                .await?;
            *socket = Some(BufReader::new(stream));
            trace!("opened tunnel socket to {}", address);
        }
        let Some(stream) = socket.as_mut() else {
            return Err(ChannelError::logic("tunnel socket vanished mid-exchange"));
        };

        let expect_continue = body.len() > self.config.http_recommended_packet_size;
        deadline
            .run("write tunnel request", async {
                wire::write_request_head(stream, address, body.len(), expect_continue).await?;
                stream.flush().await
                    .map_err(|e| ChannelError::from_io("flush tunnel request", e))
            })
            .await?;

        if expect_continue {
            // the body is committed only after the interim go-ahead
            let interim = wire::read_head(stream, deadline).await?;
            match interim.response_status()? {
                ResponseStatus::Continue => {}
                ResponseStatus::Conflict => {
                    return Err(ChannelError::ConnectionSuperseded {
                        host: address.to_string(),
                    });
                }
                other => {
                    return Err(ChannelError::IncorrectData {
                        detail: format!("expected an interim response, got {:?}", other),
                    });
                }
            }
        }

        deadline
            .run("write tunnel body", async {
                stream.write_all(body).await
                    .map_err(|e| ChannelError::from_io("write tunnel body", e))?;
                stream.flush().await
                    .map_err(|e| ChannelError::from_io("flush tunnel body", e))
            })
            .await?;

        let head = wire::read_head(stream, deadline).await?;
        match head.response_status()? {
            ResponseStatus::Ok => {
                let len = head.content_length()?;
                wire::read_body(stream, len, self.config.max_packet_size, deadline).await
            }
            ResponseStatus::Conflict => Err(ChannelError::ConnectionSuperseded {
                host: address.to_string(),
            }),
            other => Err(ChannelError::IncorrectData {
                detail: format!("unexpected http status {:?}", other),
            }),
        }
    }

    /// Replay the exact request bytes over fresh sockets until the response arrives,
    ///  a critical failure ends the connection, or the attempt budget runs out.
    async fn exchange_with_retry(
        &self,
        slot: &SocketSlot,
        address: &str,
        body: &Bytes,
        deadline: Deadline,
    ) -> ChannelResult<Bytes> {
        let mut attempts = 0u32;
        loop {
            match self.exchange_once(slot, address, body, deadline).await {
                Ok(response) => return Ok(response),
                Err(e) if !e.is_critical()
                    && e.kind() != ErrorKind::Timeout
                    && attempts < self.config.max_reconnect_attempts =>
                {
                    attempts += 1;
                    debug!(
                        "tunnel exchange with {} failed (attempt {}): {} - reconnecting",
                        address, attempts, e
                    );
                    deadline
                        .run("reconnect backoff", async {
                            tokio::time::sleep(self.config.reconnect_interval).await;
                            Ok(())
                        })
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn spawn_listener_loop(&self, channel: Arc<HttpClientChannel>) -> ChannelResult<()> {
        let manager = self.self_arc()?;
        let task_channel = channel.clone();
        let task = tokio::spawn(async move {
            manager.listener_loop(task_channel).await;
        });
        *channel.listener_task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// The long-poll loop: ask the answering side for inbound content, dispatch
    ///  whatever arrives, re-poll immediately on a timed-out marker.
    ///
    /// Each poll carries the acknowledgment cursor - the lowest push sequence not
    ///  yet processed. The answering side retains a pushed packet until the cursor
    ///  moves past it, so a push whose response was lost on the wire comes back
    ///  verbatim on the next poll; the sequence classification below deduplicates
    ///  it when the original response arrived after all.
    async fn listener_loop(self: Arc<Self>, channel: Arc<HttpClientChannel>) {
        let listener_socket: SocketSlot = tokio::sync::Mutex::new(None);
        let mut consecutive_failures = 0u32;
        let mut ack_cursor = 0u64;

        loop {
            if channel.is_closed() {
                return;
            }

            let request = TunnelPacket::new(
                HttpPacketType::Listening,
                ack_cursor,
                self.self_host_id,
                channel.key.connection_name.clone(),
                Bytes::new(),
            )
            .ser();
            let deadline = Deadline::after(
                self.config.http_listener_hold_timeout + self.config.send_timeout,
            );

            let response = match self
                .exchange_once(&listener_socket, &channel.address, &request, deadline)
                .await
                .and_then(TunnelPacket::deser)
            {
                Ok(response) => response,
                Err(e) => {
                    if e.is_critical() || consecutive_failures >= self.config.max_reconnect_attempts {
                        self.handle_connection_failure(&channel, e);
                        return;
                    }
                    consecutive_failures += 1;
                    debug!(
                        "listener poll to {} failed (attempt {}): {}",
                        channel.address, consecutive_failures, e
                    );
                    tokio::time::sleep(self.config.reconnect_interval).await;
                    continue;
                }
            };
            consecutive_failures = 0;

            match response.packet_type {
                HttpPacketType::Usual => {
                    channel.core.renew();
                    self.renew_host(&channel.key.host);
                    match channel.core.classify_inbound(response.sequence) {
                        InboundSequence::New => {
                            if let Err(e) = self.dispatch_envelope(&channel, response.payload).await {
                                if e.is_critical() {
                                    self.handle_connection_failure(&channel, e);
                                    return;
                                }
                                warn!("dropping malformed packet from {}: {}", channel.key.host, e);
                            }
                            channel.core.mark_inbound_processed(response.sequence, None);
                            ack_cursor = response.sequence + 1;
                        }
                        InboundSequence::Repeated => {
                            trace!(
                                "push {} from {} already processed, acknowledging only",
                                response.sequence, channel.key.host
                            );
                            ack_cursor = response.sequence + 1;
                        }
                        InboundSequence::Desynchronized => {
                            self.handle_connection_failure(
                                &channel,
                                channel.core.desynchronization_error(response.sequence),
                            );
                            return;
                        }
                    }
                }
                HttpPacketType::ListenerTimedOut => {
                    // nothing to deliver - re-poll immediately so the server always
                    //  holds a fresh poll
                    trace!("listener poll to {} timed out, re-polling", channel.address);
                    channel.core.renew();
                }
                HttpPacketType::ClosedManually => {
                    self.handle_connection_failure(
                        &channel,
                        ChannelError::closed("closed by the peer"),
                    );
                    return;
                }
                HttpPacketType::SenderError => {
                    self.handle_connection_failure(&channel, unpack_failure(response.payload));
                    return;
                }
                other => {
                    self.handle_connection_failure(
                        &channel,
                        ChannelError::IncorrectData {
                            detail: format!("unexpected {:?} reply to a listener poll", other),
                        },
                    );
                    return;
                }
            }
        }
    }

    async fn dispatch_envelope(
        &self,
        channel: &Arc<HttpClientChannel>,
        payload: Bytes,
    ) -> ChannelResult<()> {
        let plain = {
            let session = channel.session.lock().unwrap();
            match security::open_envelope(session.as_ref(), payload)? {
                SecurityEnvelope::Payload(plain) => plain,
                SecurityEnvelope::Handshake(_) => {
                    return Err(ChannelError::incorrect_data(
                        "handshake frame on an established listener connection",
                    ));
                }
            }
        };

        let entries = LabelledReader::new(plain).read_all()?;
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

    fn handle_connection_failure(&self, channel: &Arc<HttpClientChannel>, error: ChannelError) {
        if channel.is_closed() {
            return;
        }
        if error.is_critical() {
            warn!(
                "critical failure on tunnelled connection to {}: {} ({})",
                channel.key.host,
                error,
                error.identifier()
            );
        }
        else {
            debug!("tunnelled connection to {} failed: {}", channel.key.host, error);
        }

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

    fn channel(&self, key: &ConnectionKey) -> Option<Arc<HttpClientChannel>> {
        self.state.lock().unwrap().channels.get(key).cloned()
    }
}

/// Unpack a `SenderError` payload into the failure the answering side reported.
fn unpack_failure(payload: Bytes) -> ChannelError {
    match security::open_envelope(&security::NoSecurity, payload) {
        Err(e) => e,
        Ok(_) => ChannelError::incorrect_data("failure reply carried no failure report"),
    }
}

#[async_trait]
impl ConnectionManager for HttpClientConnectionManager {
    async fn send(&self, message: Message) -> ChannelResult<()> {
        message.deadline.check("send")?;

        if message.content.len() > self.config.max_packet_size {
            let error = ChannelError::TooLarge {
                size: message.content.len(),
                limit: self.config.max_packet_size,
            };
            if !message.one_way {
                self.dispatcher.dispatch_failure(message, error.clone()).await;
            }
            return Err(error);
        }

        let key = ConnectionKey::new(message.to, message.connection_name.clone());
        let Some(channel) = self.channel(&key) else {
            return Err(ChannelError::DestinationUnreachable {
                host: message.to.to_string(),
                detail: "no established tunnel connection".to_string(),
            });
        };

        let result = self.send_on_channel(&channel, &message).await;
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
        let victims: Vec<Arc<HttpClientChannel>> = {
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
            // tell the answering side so it can free its state; best effort only
            let request = TunnelPacket::new(
                HttpPacketType::ClosedManually,
                channel.core.next_outbound_sequence(),
                self.self_host_id,
                channel.key.connection_name.clone(),
                Bytes::new(),
            )
            .ser();
            let deadline = Deadline::after(self.config.send_timeout);
            if let Err(e) = self
                .exchange_once(&channel.sender_socket, &channel.address, &request, deadline)
                .await
            {
                debug!("close notification to {} failed: {}", channel.key.host, e);
            }

            channel.close(reason);
        }
    }

    /// The connecting side cannot accept inbound tunnels; inbound traffic arrives
    ///  through the listener polls of established connections.
    async fn start_listening(&self, address: &str) -> ChannelResult<()> {
        Err(ChannelError::LogicError {
            detail: format!(
                "the connecting side of the tunnel cannot listen (requested '{}')",
                address
            ),
        })
    }

    async fn stop_listening(&self, address: &str) -> ChannelResult<()> {
        Err(ChannelError::LogicError {
            detail: format!("not listening on '{}'", address),
        })
    }
}

impl HttpClientConnectionManager {
    async fn send_on_channel(
        &self,
        channel: &Arc<HttpClientChannel>,
        message: &Message,
    ) -> ChannelResult<()> {
        let _guard = channel.core.acquire_within(message.deadline).await?;
        channel.core.check_not_disposed()?;

        let envelope = {
            let session = channel.session.lock().unwrap();
            security::seal_payload(session.as_ref(), &labelled::encode([&message.content[..]]))?
        };
        let sequence = channel.core.next_outbound_sequence();
        let request = TunnelPacket::new(
            HttpPacketType::Usual,
            sequence,
            self.self_host_id,
            channel.key.connection_name.clone(),
            envelope,
        )
        .ser();
        channel.core.retain_pending(sequence, request.clone());

        let response_body = self
            .exchange_with_retry(&channel.sender_socket, &channel.address, &request, message.deadline)
            .await?;
        let response = TunnelPacket::deser(response_body)?;

        match response.packet_type {
            HttpPacketType::Usual | HttpPacketType::RequestRepeated => {
                channel.core.acknowledge_pending(sequence);
                channel.core.renew();
                Ok(())
            }
            HttpPacketType::Desynchronization => Err(ChannelError::Desynchronization {
                expected: sequence,
                actual: response.sequence,
            }),
            HttpPacketType::SenderError => Err(unpack_failure(response.payload)),
            HttpPacketType::ClosedManually => Err(ChannelError::closed("closed by the peer")),
            other => Err(ChannelError::IncorrectData {
                detail: format!("unexpected {:?} reply to a message exchange", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_config, ChannelConfig};
    use crate::http::server::HttpServerConnectionManager;
    use crate::security::{AesGcmSession, NoSecurity};
    use rstest::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct RecordingDispatcher {
        received: mpsc::UnboundedSender<(Bytes, HostId)>,
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

        async fn dispatch_failure(&self, _message: Message, _error: ChannelError) {}
    }

    fn no_security() -> SessionFactory {
        Arc::new(|| Box::new(NoSecurity))
    }

    fn aes_sessions(key: [u8; 32]) -> SessionFactory {
        Arc::new(move || Box::new(AesGcmSession::new(&key)))
    }

    fn quick_poll_config() -> ChannelConfig {
        let mut config = default_config();
        config.http_listener_hold_timeout = Duration::from_millis(200);
        config
    }

    fn server(
        config: ChannelConfig,
        sessions: SessionFactory,
    ) -> (Arc<HttpServerConnectionManager>, mpsc::UnboundedReceiver<(Bytes, HostId)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = HttpServerConnectionManager::new(
            Arc::new(config),
            Arc::new(RecordingDispatcher { received: tx }),
            sessions,
        )
        .unwrap();
        (manager, rx)
    }

    fn client(
        config: ChannelConfig,
        sessions: SessionFactory,
    ) -> (Arc<HttpClientConnectionManager>, mpsc::UnboundedReceiver<(Bytes, HostId)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = HttpClientConnectionManager::new(
            Arc::new(config),
            Arc::new(RecordingDispatcher { received: tx }),
            sessions,
        )
        .unwrap();
        (manager, rx)
    }

    async fn bound_server(
        config: ChannelConfig,
        sessions: SessionFactory,
    ) -> (Arc<HttpServerConnectionManager>, mpsc::UnboundedReceiver<(Bytes, HostId)>, String) {
        let (manager, rx) = server(config, sessions);
        manager.start_listening("127.0.0.1:0").await.unwrap();
        let addr = manager.local_addr("127.0.0.1:0").unwrap().to_string();
        (manager, rx, addr)
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
    fn test_client_to_server_end_to_end() {
        rt().block_on(async {
            let (server, mut server_rx, addr) =
                bound_server(quick_poll_config(), no_security()).await;
            let (client, _client_rx) = client(quick_poll_config(), no_security());

            let server_id = client.connect(&addr, None).await.unwrap();
            assert_eq!(server_id, server.self_host_id());

            client
                .send(Message::new(
                    server_id,
                    Bytes::from_static(b"first"),
                    Deadline::after(Duration::from_secs(5)),
                ))
                .await
                .unwrap();
            client
                .send(Message::new(
                    server_id,
                    Bytes::from_static(b"second"),
                    Deadline::after(Duration::from_secs(5)),
                ))
                .await
                .unwrap();

            let (content, from) = server_rx.recv().await.unwrap();
            assert_eq!(content.as_ref(), b"first");
            assert_eq!(from, client.self_host_id());

            let (content, _) = server_rx.recv().await.unwrap();
            assert_eq!(content.as_ref(), b"second");
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_server_to_client_via_listener_poll() {
        rt().block_on(async {
            let (server, _server_rx, addr) =
                bound_server(quick_poll_config(), no_security()).await;
            let (client, mut client_rx) = client(quick_poll_config(), no_security());

            client.connect(&addr, None).await.unwrap();

            server
                .send(Message::new(
                    client.self_host_id(),
                    Bytes::from_static(b"pushed"),
                    Deadline::after(Duration::from_secs(5)),
                ))
                .await
                .unwrap();

            let (content, from) = client_rx.recv().await.unwrap();
            assert_eq!(content.as_ref(), b"pushed");
            assert_eq!(from, server.self_host_id());
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_encrypted_end_to_end() {
        rt().block_on(async {
            let key = [42u8; 32];
            let (server, mut server_rx, addr) =
                bound_server(quick_poll_config(), aes_sessions(key)).await;
            let (client, mut client_rx) = client(quick_poll_config(), aes_sessions(key));

            let server_id = client.connect(&addr, None).await.unwrap();

            client
                .send(Message::new(
                    server_id,
                    Bytes::from_static(b"secret"),
                    Deadline::after(Duration::from_secs(5)),
                ))
                .await
                .unwrap();
            let (content, _) = server_rx.recv().await.unwrap();
            assert_eq!(content.as_ref(), b"secret");

            server
                .send(Message::new(
                    client.self_host_id(),
                    Bytes::from_static(b"secret-back"),
                    Deadline::after(Duration::from_secs(5)),
                ))
                .await
                .unwrap();
            let (content, _) = client_rx.recv().await.unwrap();
            assert_eq!(content.as_ref(), b"secret-back");
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_connect_to_dead_port_fails() {
        rt().block_on(async {
            // bind and drop to get a port nobody listens on
            let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = dead.local_addr().unwrap().to_string();
            drop(dead);

            let mut config = quick_poll_config();
            config.max_reconnect_attempts = 0;
            config.connect_timeout = Duration::from_secs(2);
            let (client, _client_rx) = client(config, no_security());

            let err = client.connect(&addr, None).await.unwrap_err();
            assert!(
                matches!(err.kind(), ErrorKind::DestinationUnreachable | ErrorKind::ConnectionClosed),
                "unexpected kind: {:?}",
                err.kind()
            );
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_release_connections_then_send_fails() {
        rt().block_on(async {
            let (_server, _server_rx, addr) =
                bound_server(quick_poll_config(), no_security()).await;
            let (client, _client_rx) = client(quick_poll_config(), no_security());

            let server_id = client.connect(&addr, None).await.unwrap();
            client
                .release_connections(Some(server_id), ConnectionTypes::all(), "test teardown")
                .await;

            let err = client
                .send(Message::new(
                    server_id,
                    Bytes::from_static(b"late"),
                    Deadline::after(Duration::from_secs(1)),
                ))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DestinationUnreachable);
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_client_cannot_listen() {
        rt().block_on(async {
            let (client, _client_rx) = client(quick_poll_config(), no_security());
            let err = client.start_listening("127.0.0.1:0").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::LogicError);
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_large_message_uses_continue_handshake() {
        rt().block_on(async {
            let mut config = quick_poll_config();
            config.http_recommended_packet_size = 1024;
            let (_server, mut server_rx, addr) =
                bound_server(config.clone(), no_security()).await;
            let (client, _client_rx) = client(config, no_security());

            let server_id = client.connect(&addr, None).await.unwrap();
            let big: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();

            client
                .send(Message::new(
                    server_id,
                    Bytes::from(big.clone()),
                    Deadline::after(Duration::from_secs(10)),
                ))
                .await
                .unwrap();

            let (content, _) = server_rx.recv().await.unwrap();
            assert_eq!(content.to_vec(), big);
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_reconnect_restarts_sequences() {
        rt().block_on(async {
            let (_server, mut server_rx, addr) =
                bound_server(quick_poll_config(), no_security()).await;
            let (client, _client_rx) = client(quick_poll_config(), no_security());

            let server_id = client.connect(&addr, None).await.unwrap();
            client
                .send(Message::new(
                    server_id,
                    Bytes::from_static(b"before"),
                    Deadline::after(Duration::from_secs(5)),
                ))
                .await
                .unwrap();

            // a fresh connection starts its sequences from zero; the reset on
            //  establishment clears the answering side's stale tracker
            let reconnected_id = client.connect(&addr, None).await.unwrap();
            assert_eq!(reconnected_id, server_id);
            client
                .send(Message::new(
                    server_id,
                    Bytes::from_static(b"after"),
                    Deadline::after(Duration::from_secs(5)),
                ))
                .await
                .unwrap();

            let (content, _) = server_rx.recv().await.unwrap();
            assert_eq!(content.as_ref(), b"before");
            let (content, _) = server_rx.recv().await.unwrap();
            assert_eq!(content.as_ref(), b"after");
        });
    }

    /// A scripted answering side over raw loopback TCP: establishment and listener
    ///  polls get well-formed replies, but the first message exchange has its socket
    ///  killed after the request was read, so the response never arrives. Every
    ///  message request body is recorded for inspection.
    async fn flaky_answering_side(
        recorded: mpsc::UnboundedSender<Bytes>,
    ) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let answering_id = HostId::new_random();
        let exchanges_seen = Arc::new(std::sync::atomic::AtomicU32::new(0));

        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let recorded = recorded.clone();
                let exchanges_seen = exchanges_seen.clone();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(socket);
                    loop {
                        let deadline = Deadline::after(Duration::from_secs(10));
                        let Ok(head) = wire::read_head(&mut reader, deadline).await else {
                            return;
                        };
                        let len = head.content_length().unwrap();
                        if head.expects_continue() {
                            wire::write_continue(reader.get_mut()).await.unwrap();
                            reader.get_mut().flush().await.unwrap();
                        }
                        let body = wire::read_body(&mut reader, len, usize::MAX, deadline)
                            .await
                            .unwrap();
                        let packet = TunnelPacket::deser(body.clone()).unwrap();

                        let reply = match packet.packet_type {
                            HttpPacketType::Establishing
                            | HttpPacketType::EstablishingResetConnection => TunnelPacket::new(
                                HttpPacketType::Establishing,
                                0,
                                answering_id,
                                packet.connection_name,
                                Bytes::new(),
                            )
                            .ser(),
                            HttpPacketType::Listening => {
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                TunnelPacket::new(
                                    HttpPacketType::ListenerTimedOut,
                                    packet.sequence,
                                    answering_id,
                                    packet.connection_name,
                                    Bytes::new(),
                                )
                                .ser()
                            }
                            HttpPacketType::Usual => {
                                let _ = recorded.send(body);
                                if exchanges_seen.fetch_add(1, Ordering::AcqRel) == 0 {
                                    // kill the socket with the request read but unanswered
                                    return;
                                }
                                let ack = security::seal_payload(
                                    &NoSecurity,
                                    &labelled::encode(std::iter::empty::<&[u8]>()),
                                )
                                .unwrap();
                                TunnelPacket::new(
                                    HttpPacketType::Usual,
                                    packet.sequence,
                                    answering_id,
                                    packet.connection_name,
                                    ack,
                                )
                                .ser()
                            }
                            _ => return,
                        };
                        wire::write_response_head(reader.get_mut(), 200, "OK", reply.len())
                            .await
                            .unwrap();
                        reader.get_mut().write_all(&reply).await.unwrap();
                        reader.get_mut().flush().await.unwrap();
                    }
                });
            }
        });
        addr
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_lost_response_replays_identical_request_bytes() {
        rt().block_on(async {
            let (recorded_tx, mut recorded_rx) = mpsc::unbounded_channel();
            let addr = flaky_answering_side(recorded_tx).await;

            let mut config = quick_poll_config();
            config.reconnect_interval = Duration::from_millis(50);
            let (client, _client_rx) = client(config, no_security());

            let answering_id = client.connect(&addr, None).await.unwrap();
            client
                .send(Message::new(
                    answering_id,
                    Bytes::from_static(b"survives the socket"),
                    Deadline::after(Duration::from_secs(10)),
                ))
                .await
                .unwrap();

            // the first attempt's socket died after the request was read; the retry
            //  over a fresh socket must carry the exact same bytes
            let first_attempt = recorded_rx.recv().await.unwrap();
            let second_attempt = recorded_rx.recv().await.unwrap();
            assert_eq!(first_attempt, second_attempt);
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_oversized_message_rejected_before_transmission() {
        rt().block_on(async {
            let mut config = quick_poll_config();
            config.max_packet_size = 64;
            let (_server, mut server_rx, addr) =
                bound_server(quick_poll_config(), no_security()).await;
            let (client, _client_rx) = client(config, no_security());

            let server_id = client.connect(&addr, None).await.unwrap();

            let err = client
                .send(Message::new(
                    server_id,
                    Bytes::from(vec![0u8; 65]),
                    Deadline::after(Duration::from_secs(5)),
                ))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TooLarge);

            // the bound check rejects without touching the connection
            client
                .send(Message::new(
                    server_id,
                    Bytes::from_static(b"small"),
                    Deadline::after(Duration::from_secs(5)),
                ))
                .await
                .unwrap();
            let (content, _) = server_rx.recv().await.unwrap();
            assert_eq!(content.as_ref(), b"small");
        });
    }

    #[rstest]
    #[timeout(Duration::from_secs(30))]
    fn test_mismatched_keys_fail_establishment() {
        rt().block_on(async {
            let (_server, _server_rx, addr) =
                bound_server(quick_poll_config(), aes_sessions([1; 32])).await;
            let (client, _client_rx) = client(quick_poll_config(), aes_sessions([2; 32]));

            let err = client.connect(&addr, None).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SecurityFailure);
        });
    }
}
