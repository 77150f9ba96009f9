//! Connection manager: accept loop, per-connection protocol state machine,
//! local/remote dispatch and the transport inbound path.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use switchyard_protocol::{
    ErrorBody, HandshakeRequest, HandshakeResponse, KickBody, MAX_PACKET_SIZE, Message,
    MessageCodec, MessageError, MessageKind, Packet, PacketType, RouteDictionary, peek_header,
};
use switchyard_transport::{
    Envelope, EnvelopeKind, HandlerError, HandlerRegistry, PushFanout, Route, RoutingError,
    SessionHandle, TransportClient, UserLocator,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::connection::{Connection, ConnectionOptions, ConnectionState, TcpConnection};
use crate::error::GatewayError;
use crate::pool::{ConnectionBuffers, ObjectPool};
use crate::registry::{ConnectionRegistry, Removed};
use crate::scheduler::Scheduler;
use crate::selector::InstanceSelector;
use crate::session::SharedData;

/// Gateway tuning.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Heartbeat interval announced in the handshake and used for heartbeats.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is closed.
    pub read_deadline: Duration,
    /// Time a client has to complete the handshake before it is kicked.
    pub handshake_timeout: Duration,
    pub max_connections: usize,
    pub inbound_queue_capacity: usize,
    pub outbound_queue_capacity: usize,
    pub push_queue_capacity: usize,
    /// Idle per-connection buffers kept for reuse.
    pub pool_capacity: usize,
    /// Payload size from which outbound payloads are deflated; 0 disables.
    pub compress_threshold: usize,
    pub max_packet_size: usize,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            read_deadline: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            max_connections: 4096,
            inbound_queue_capacity: 128,
            outbound_queue_capacity: 128,
            push_queue_capacity: 1024,
            pool_capacity: 256,
            compress_threshold: 0,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

/// Owns the client connections of one gateway process.
pub struct ConnectionManager {
    options: GatewayOptions,
    codec: Arc<MessageCodec>,
    handshake_ack: Packet,
    handlers: Arc<HandlerRegistry>,
    selector: Arc<InstanceSelector>,
    transport: Arc<TransportClient>,
    locator: Arc<dyn UserLocator>,
    fanout: PushFanout,
    registry: ConnectionRegistry,
    shared: Arc<SharedData>,
    pool: ObjectPool<ConnectionBuffers>,
    timers: Scheduler<String>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionManager {
    /// Build a manager. The handshake reply is rendered once here from the
    /// heartbeat interval and the current contents of `dictionary`.
    pub fn new(
        options: GatewayOptions,
        dictionary: Arc<RouteDictionary>,
        handlers: Arc<HandlerRegistry>,
        selector: Arc<InstanceSelector>,
        transport: Arc<TransportClient>,
        locator: Arc<dyn UserLocator>,
    ) -> Result<Arc<Self>, GatewayError> {
        let reply = HandshakeResponse::ok(options.heartbeat_interval.as_secs(), dictionary.snapshot());
        let handshake_ack = Packet::new(PacketType::HandshakeAck, serde_json::to_vec(&reply)?);
        let codec = Arc::new(MessageCodec::new(dictionary, options.compress_threshold));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            fanout: PushFanout::new(Arc::clone(&transport), Arc::clone(&locator)),
            registry: ConnectionRegistry::new(options.max_connections),
            pool: ObjectPool::new(options.pool_capacity),
            shared: Arc::new(SharedData::default()),
            timers: Scheduler::new(),
            options,
            codec,
            handshake_ack,
            handlers,
            selector,
            transport,
            locator,
            shutdown_tx,
        }))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn codec(&self) -> &Arc<MessageCodec> {
        &self.codec
    }

    /// This gateway's process identity.
    pub fn identity(&self) -> &str {
        self.transport.identity()
    }

    pub fn connection(&self, id: &str) -> Option<Arc<dyn Connection>> {
        self.registry.get(id)
    }

    /// Connection bound to `user_id` on this gateway.
    pub fn connection_by_user(&self, user_id: &str) -> Option<Arc<dyn Connection>> {
        self.registry.by_user(user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Buffer sets waiting in the pool for the next accepted socket.
    pub fn idle_buffers(&self) -> usize {
        self.pool.idle()
    }

    /// Data shared by every session on this gateway.
    pub fn shared(&self) -> &Arc<SharedData> {
        &self.shared
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Subscribe to the transport and spawn the transport and push
    /// dispatcher tasks.
    pub fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        let inbound = self.transport.run()?;
        let (push_tx, push_rx) = mpsc::channel(self.options.push_queue_capacity.max(1));

        let this = Arc::clone(self);
        tokio::spawn(async move { this.transport_loop(inbound, push_tx).await });
        let this = Arc::clone(self);
        tokio::spawn(async move { this.push_loop(push_rx).await });
        Ok(())
    }

    /// Bind `addr` and accept connections until [`Self::close`].
    pub async fn run(self: &Arc<Self>, addr: SocketAddr) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(identity = %self.identity(), "gateway listening on {addr}");
        self.run_with_listener(listener).await
    }

    /// Accept loop over a pre-bound listener.
    pub async fn run_with_listener(self: &Arc<Self>, listener: TcpListener) -> Result<(), GatewayError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Err(GatewayError::Closed);
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = self.accept(stream) {
                        tracing::warn!(%peer, "rejected connection: {e}");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!(identity = %self.identity(), "accept loop stopped");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Take ownership of an accepted stream and start its tasks.
    pub fn accept(self: &Arc<Self>, stream: TcpStream) -> Result<Arc<TcpConnection>, GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::Closed);
        }
        let options = ConnectionOptions {
            heartbeat_interval: self.options.heartbeat_interval,
            read_deadline: self.options.read_deadline,
            outbound_capacity: self.options.outbound_queue_capacity,
            max_packet_size: self.options.max_packet_size,
        };
        let id = Uuid::new_v4().to_string();
        let mut buffers = self.pool.get();
        let write_buffer = std::mem::take(&mut buffers.write);
        let (connection, reader) =
            TcpConnection::open(id, stream, Arc::clone(&self.shared), &options, write_buffer)?;
        let handle: Arc<dyn Connection> = connection.clone();
        if let Err(e) = self.attach(Arc::clone(&handle)) {
            connection.close();
            return Err(e);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(self.options.inbound_queue_capacity.max(1));
        let this = Arc::clone(self);
        tokio::spawn(async move { this.dispatch_loop(handle, inbound_rx).await });

        let this = Arc::clone(self);
        let reader_conn = Arc::clone(&connection);
        tokio::spawn(async move {
            reader_conn.read_loop(reader, &mut buffers, inbound_tx).await;
            this.disconnect(reader_conn.id());
            if let Some(write) = reader_conn.finish_writer().await {
                buffers.write = write;
            }
            this.pool.put(buffers);
        });

        tracing::info!(connection = %connection.id(), peer = %connection.peer(), "accepted connection");
        Ok(connection)
    }

    /// Register a connection and arm its handshake timer.
    pub fn attach(self: &Arc<Self>, connection: Arc<dyn Connection>) -> Result<(), GatewayError> {
        let id = connection.id().to_string();
        self.registry.insert(connection)?;

        let weak: Weak<Self> = Arc::downgrade(self);
        let timer_id = id.clone();
        self.timers.schedule(id, self.options.handshake_timeout, async move {
            if let Some(manager) = weak.upgrade() {
                manager.expire_handshake(&timer_id);
            }
        });
        Ok(())
    }

    /// Remove a connection and release everything tied to it. Returns
    /// whether the connection was still registered.
    pub fn disconnect(&self, id: &str) -> bool {
        let Some(Removed { connection, user }) = self.registry.remove(id) else {
            return false;
        };
        self.timers.cancel(&id.to_string());
        connection.close();
        // A user that reconnected here keeps its locator entry.
        if let Some(user) = &user {
            self.locator.unbind(user, self.identity());
        }
        let session = connection.session();
        let user_id = session.user_id();
        session.clear();
        tracing::info!(connection = %id, user = %user_id, "connection closed");
        true
    }

    /// Send a `Kick` packet with `reason` and close the connection.
    pub fn kick(&self, id: &str, reason: &str) -> Result<(), GatewayError> {
        let connection = self
            .registry
            .get(id)
            .ok_or_else(|| GatewayError::UnknownConnection(id.to_string()))?;
        let body = serde_json::to_vec(&KickBody {
            reason: reason.to_string(),
        })?;
        if let Err(e) = connection.send_packet(Packet::new(PacketType::Kick, body)) {
            tracing::debug!(connection = %id, "kick packet not queued: {e}");
        }
        tracing::info!(connection = %id, reason, "kicking connection");
        self.disconnect(id);
        Ok(())
    }

    /// Stop accepting, close every connection and the transport.
    pub fn close(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        self.timers.cancel_all();
        for connection in self.registry.all() {
            self.disconnect(connection.id());
        }
        self.transport.close();
        tracing::info!(identity = %self.identity(), "gateway closed");
    }

    fn expire_handshake(&self, id: &str) {
        let Some(connection) = self.registry.get(id) else {
            return;
        };
        if connection.state() != ConnectionState::Established
            && let Err(e) = self.kick(id, "handshake timeout")
        {
            tracing::debug!(connection = %id, "handshake timeout kick failed: {e}");
        }
    }

    // ------------------------------------------------------------------
    // Client packets
    // ------------------------------------------------------------------

    async fn dispatch_loop(&self, connection: Arc<dyn Connection>, mut inbound: mpsc::Receiver<Packet>) {
        while let Some(packet) = inbound.recv().await {
            self.handle_packet(&connection, packet);
        }
    }

    /// Advance the connection state machine with one client packet.
    pub fn handle_packet(&self, connection: &Arc<dyn Connection>, packet: Packet) {
        match packet.kind {
            PacketType::Handshake => self.on_handshake(connection, &packet.body),
            PacketType::HandshakeAck => self.on_handshake_ack(connection),
            PacketType::Heartbeat => {
                if connection.state() == ConnectionState::Established
                    && let Err(e) = connection.send_packet(Packet::new(PacketType::Heartbeat, Vec::new()))
                {
                    tracing::debug!(connection = %connection.id(), "heartbeat echo failed: {e}");
                }
            }
            PacketType::Data => {
                if connection.state() != ConnectionState::Established {
                    tracing::warn!(connection = %connection.id(), state = ?connection.state(), "data before handshake");
                    self.disconnect(connection.id());
                    return;
                }
                self.on_data(connection, &packet.body);
            }
            PacketType::Kick => {
                tracing::debug!(connection = %connection.id(), "client sent kick");
                self.disconnect(connection.id());
            }
        }
    }

    fn on_handshake(&self, connection: &Arc<dyn Connection>, body: &[u8]) {
        if connection.state() != ConnectionState::Connected {
            tracing::debug!(connection = %connection.id(), "duplicate handshake ignored");
            return;
        }
        let request: HandshakeRequest = if body.is_empty() {
            HandshakeRequest::default()
        } else {
            match serde_json::from_slice(body) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(connection = %connection.id(), "bad handshake body: {e}");
                    self.disconnect(connection.id());
                    return;
                }
            }
        };
        tracing::debug!(
            connection = %connection.id(),
            client = request.sys.client_type.as_deref().unwrap_or("unknown"),
            version = request.sys.version.as_deref().unwrap_or("unknown"),
            "handshake"
        );
        connection.set_state(ConnectionState::Handshaking);
        if let Err(e) = connection.send_packet(self.handshake_ack.clone()) {
            tracing::warn!(connection = %connection.id(), "handshake reply failed: {e}");
            self.disconnect(connection.id());
        }
    }

    fn on_handshake_ack(&self, connection: &Arc<dyn Connection>) {
        if connection.state() != ConnectionState::Handshaking {
            tracing::debug!(connection = %connection.id(), "unexpected handshake ack ignored");
            return;
        }
        connection.set_state(ConnectionState::Established);
        self.timers.cancel(&connection.id().to_string());
        tracing::debug!(connection = %connection.id(), "connection established");
    }

    fn on_data(&self, connection: &Arc<dyn Connection>, body: &[u8]) {
        let message = match self.codec.decode(body) {
            Ok(message) => message,
            Err(e) => {
                self.reject_message(connection.as_ref(), body, &e);
                return;
            }
        };
        if !matches!(message.kind, MessageKind::Request | MessageKind::Notify) {
            tracing::debug!(connection = %connection.id(), kind = ?message.kind, "ignoring client message");
            return;
        }

        let result = self.route(connection, &message);
        match (message.kind, result) {
            (_, Ok(None)) => {}
            (MessageKind::Request, Ok(Some(payload))) => {
                self.reply(connection.as_ref(), &Message::response(message.id, payload));
            }
            (MessageKind::Request, Err(e)) => {
                tracing::debug!(connection = %connection.id(), route = %message.route, "request failed: {e}");
                let body = e.to_body().to_bytes();
                self.reply(connection.as_ref(), &Message::error_response(message.id, body));
            }
            (_, Ok(Some(_))) => {}
            (_, Err(e)) => {
                tracing::debug!(connection = %connection.id(), route = %message.route, "notify failed: {e}");
            }
        }
    }

    /// Answer a message that failed to decode. Route and payload failures
    /// only cost the message; broken framing closes the connection.
    fn reject_message(&self, connection: &dyn Connection, body: &[u8], error: &MessageError) {
        let header = peek_header(body);
        match (error.message_code(), header) {
            (Some(code), Ok((MessageKind::Request, id))) => {
                tracing::debug!(connection = %connection.id(), id, "request rejected: {error}");
                let body = ErrorBody::new(code, error.to_string()).to_bytes();
                self.reply(connection, &Message::error_response(id, body));
            }
            (Some(_), Ok((kind, _))) => {
                tracing::debug!(connection = %connection.id(), ?kind, "message dropped: {error}");
            }
            _ => {
                tracing::warn!(connection = %connection.id(), "undecodable message: {error}");
                self.disconnect(connection.id());
            }
        }
    }

    /// Run a local handler or forward to a backend. `Ok(None)` means the
    /// message was forwarded and the reply will arrive over the transport.
    fn route(
        &self,
        connection: &Arc<dyn Connection>,
        message: &Message,
    ) -> Result<Option<Vec<u8>>, HandlerError> {
        let route = Route::parse(&message.route)?;
        if self.handlers.serves(&route.service) {
            let handler = self.handlers.get(&route)?;
            let result = handler.call(connection.session().as_ref(), &message.payload);
            self.index_user(connection.as_ref());
            return result.map(Some);
        }
        self.forward(connection.as_ref(), &route, message)?;
        Ok(None)
    }

    fn forward(&self, connection: &dyn Connection, route: &Route, message: &Message) -> Result<(), HandlerError> {
        let destination = self
            .selector
            .select(&route.service)
            .ok_or_else(|| RoutingError::NoInstance(route.service.clone()))?;
        let session = connection.session();
        let mut envelope = Envelope::message(self.identity(), &destination, message.clone());
        envelope.connection_id = connection.id().to_string();
        envelope.user_id = session.user_id();
        envelope.session = session.snapshot();
        self.transport.send_envelope(&envelope)?;
        tracing::trace!(connection = %connection.id(), %route, to = %destination, "forwarded");
        Ok(())
    }

    fn reply(&self, connection: &dyn Connection, message: &Message) {
        if let Err(e) = connection.send_message(&self.codec, message) {
            tracing::warn!(connection = %connection.id(), id = message.id, "response dropped: {e}");
        }
    }

    /// Index the session's user, if newly bound, here and in the locator.
    fn index_user(&self, connection: &dyn Connection) {
        let user_id = connection.session().user_id();
        if user_id.is_empty() || self.registry.is_bound(&user_id, connection.id()) {
            return;
        }
        if let Some(previous) = self.registry.bind_user(&user_id, connection.id()) {
            tracing::info!(user = %user_id, previous = %previous, "user moved to a new connection");
        }
        self.locator.bind(&user_id, self.identity());
        tracing::debug!(connection = %connection.id(), user = %user_id, "user bound");
    }

    // ------------------------------------------------------------------
    // Transport inbound
    // ------------------------------------------------------------------

    async fn transport_loop(&self, mut inbound: mpsc::Receiver<Vec<u8>>, push_tx: mpsc::Sender<Envelope>) {
        while let Some(bytes) = inbound.recv().await {
            let envelope = match Envelope::decode(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!("dropping undecodable envelope: {e}");
                    continue;
                }
            };
            let is_push = envelope.kind == EnvelopeKind::Message
                && envelope.message.as_ref().is_some_and(|m| m.kind == MessageKind::Push);
            if is_push {
                if push_tx.send(envelope).await.is_err() {
                    break;
                }
            } else {
                self.handle_envelope(envelope);
            }
        }
        tracing::debug!(identity = %self.identity(), "transport inbound ended");
    }

    async fn push_loop(&self, mut inbound: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            self.handle_envelope(envelope);
        }
    }

    /// Apply one envelope received from a backend.
    pub fn handle_envelope(&self, envelope: Envelope) {
        match envelope.kind {
            EnvelopeKind::SessionSync => self.apply_sync(&envelope),
            EnvelopeKind::Message => {
                let Some(message) = envelope.message.as_ref() else {
                    tracing::warn!(from = %envelope.source, "message envelope without a message");
                    return;
                };
                match message.kind {
                    MessageKind::Push => self.deliver_push(&envelope, message),
                    MessageKind::Request | MessageKind::Response => self.deliver_response(&envelope, message),
                    MessageKind::Notify => {
                        tracing::debug!(from = %envelope.source, "notify envelope ignored on gateway");
                    }
                }
            }
        }
    }

    fn apply_sync(&self, envelope: &Envelope) {
        let Some(connection) = self.registry.get(&envelope.connection_id) else {
            tracing::debug!(connection = %envelope.connection_id, "sync for a closed connection dropped");
            return;
        };
        let session = connection.session();
        if !envelope.user_id.is_empty() {
            match session.bind_user(&envelope.user_id) {
                Ok(_) => self.index_user(connection.as_ref()),
                Err(e) => tracing::warn!(connection = %envelope.connection_id, "sync bind rejected: {e}"),
            }
        }
        session.apply(&envelope.session);
    }

    fn deliver_response(&self, envelope: &Envelope, message: &Message) {
        let Some(connection) = self.registry.get(&envelope.connection_id) else {
            tracing::debug!(connection = %envelope.connection_id, id = message.id, "response for a closed connection dropped");
            return;
        };
        let response = Message {
            kind: MessageKind::Response,
            route: String::new(),
            ..message.clone()
        };
        self.reply(connection.as_ref(), &response);
    }

    fn deliver_push(&self, envelope: &Envelope, message: &Message) {
        let targets: Vec<Arc<dyn Connection>> = if envelope.users.is_empty() {
            self.registry.get(&envelope.connection_id).into_iter().collect()
        } else {
            envelope
                .users
                .iter()
                .filter_map(|user| self.registry.by_user(user))
                .collect()
        };
        for connection in &targets {
            if let Err(e) = connection.send_message(&self.codec, message) {
                tracing::debug!(connection = %connection.id(), route = %message.route, "push dropped: {e}");
            }
        }
        tracing::trace!(route = %message.route, delivered = targets.len(), "push delivered");
    }

    // ------------------------------------------------------------------
    // Push
    // ------------------------------------------------------------------

    /// Push `payload` on `route` to `users` on whichever gateways hold them.
    /// Returns the number of gateways the push was sent to.
    pub fn push(&self, users: &[String], route: &str, payload: &[u8]) -> usize {
        self.fanout.push(None, users, payload, route)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.timers.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RecordingConnection;
    use crate::selector::SelectPolicy;
    use serde_json::{Value, json};
    use switchyard_discovery::{Address, Attributes, ResolverState};
    use switchyard_protocol::ErrorBody;
    use switchyard_transport::{Bus, MemoryBus, MemoryUserLocator, Scope, SessionData};

    struct Fixture {
        manager: Arc<ConnectionManager>,
        bus: Arc<MemoryBus>,
        gateway_rx: mpsc::Receiver<Vec<u8>>,
        locator: Arc<MemoryUserLocator>,
        instances: watch::Sender<ResolverState>,
    }

    fn options() -> GatewayOptions {
        GatewayOptions {
            heartbeat_interval: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            max_connections: 8,
            ..GatewayOptions::default()
        }
    }

    fn fixture(options: GatewayOptions) -> Fixture {
        let bus = Arc::new(MemoryBus::new());
        let transport = Arc::new(TransportClient::new("gate-1", bus.clone(), 64));
        let gateway_rx = transport.run().unwrap();

        let dictionary = Arc::new(RouteDictionary::new());
        dictionary.register("local.mod.echo", 1).unwrap();

        let mut handlers = HandlerRegistry::new();
        handlers.register("local.mod.echo", |_s, p| Ok(p.to_vec())).unwrap();
        handlers
            .register("local.mod.login", |s, p| {
                let user = String::from_utf8_lossy(p).to_string();
                s.bind(&user)?;
                s.put("level", json!(1), Scope::Connection)?;
                Ok(b"welcome".to_vec())
            })
            .unwrap();

        let selector = InstanceSelector::new(SelectPolicy::RoundRobin);
        let (instances, rx) = watch::channel(ResolverState::default());
        selector.add_service("remote", rx);
        let locator = Arc::new(MemoryUserLocator::new());

        let manager = ConnectionManager::new(
            options,
            dictionary,
            Arc::new(handlers),
            Arc::new(selector),
            transport,
            locator.clone(),
        )
        .unwrap();

        Fixture {
            manager,
            bus,
            gateway_rx,
            locator,
            instances,
        }
    }

    fn connect(f: &Fixture, id: &str) -> (Arc<RecordingConnection>, Arc<dyn Connection>) {
        let conn = Arc::new(RecordingConnection::new(id, Arc::clone(f.manager.shared())));
        let handle: Arc<dyn Connection> = conn.clone();
        f.manager.attach(Arc::clone(&handle)).unwrap();
        (conn, handle)
    }

    fn establish(f: &Fixture, id: &str) -> (Arc<RecordingConnection>, Arc<dyn Connection>) {
        let (conn, handle) = connect(f, id);
        f.manager
            .handle_packet(&handle, Packet::new(PacketType::Handshake, b"{}".to_vec()));
        f.manager
            .handle_packet(&handle, Packet::new(PacketType::HandshakeAck, Vec::new()));
        assert_eq!(conn.state(), ConnectionState::Established);
        conn.take_packets();
        (conn, handle)
    }

    fn data(f: &Fixture, message: &Message) -> Packet {
        Packet::new(PacketType::Data, f.manager.codec().encode(message).unwrap())
    }

    fn error_code(message: &Message) -> u16 {
        assert!(message.is_error);
        serde_json::from_slice::<ErrorBody>(&message.payload).unwrap().code
    }

    #[tokio::test]
    async fn test_handshake_reply_carries_heartbeat_and_dict() {
        let f = fixture(options());
        let (conn, handle) = connect(&f, "c1");
        f.manager
            .handle_packet(&handle, Packet::new(PacketType::Handshake, br#"{"sys":{"type":"test"}}"#.to_vec()));

        assert_eq!(conn.state(), ConnectionState::Handshaking);
        let packets = conn.take_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].kind, PacketType::HandshakeAck);
        let body: Value = serde_json::from_slice(&packets[0].body).unwrap();
        assert_eq!(body["code"], 200);
        assert_eq!(body["sys"]["heartbeat"], 5);
        assert_eq!(body["sys"]["dict"]["local.mod.echo"], 1);

        f.manager
            .handle_packet(&handle, Packet::new(PacketType::HandshakeAck, Vec::new()));
        assert_eq!(conn.state(), ConnectionState::Established);
        assert!(!f.manager.timers.is_scheduled(&"c1".to_string()));
    }

    #[tokio::test]
    async fn test_bad_handshake_body_closes() {
        let f = fixture(options());
        let (conn, handle) = connect(&f, "c1");
        f.manager
            .handle_packet(&handle, Packet::new(PacketType::Handshake, b"{nope".to_vec()));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(f.manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_data_before_handshake_is_fatal() {
        let f = fixture(options());
        let (conn, handle) = connect(&f, "c1");
        let packet = data(&f, &Message::request(1, "local.mod.echo", vec![]));
        f.manager.handle_packet(&handle, packet);

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(f.manager.connection("c1").is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_echo() {
        let f = fixture(options());
        let (conn, handle) = establish(&f, "c1");
        f.manager
            .handle_packet(&handle, Packet::new(PacketType::Heartbeat, Vec::new()));
        let packets = conn.take_packets();
        assert_eq!(packets, vec![Packet::new(PacketType::Heartbeat, Vec::new())]);
    }

    #[tokio::test]
    async fn test_local_request_gets_response_with_same_id() {
        let f = fixture(options());
        let (conn, handle) = establish(&f, "c1");
        f.manager
            .handle_packet(&handle, data(&f, &Message::request(42, "local.mod.echo", b"ping".to_vec())));

        let messages = conn.take_messages(f.manager.codec());
        assert_eq!(messages, vec![Message::response(42, b"ping".to_vec())]);
    }

    #[tokio::test]
    async fn test_local_notify_gets_no_response() {
        let f = fixture(options());
        let (conn, handle) = establish(&f, "c1");
        f.manager
            .handle_packet(&handle, data(&f, &Message::notify("local.mod.echo", b"x".to_vec())));
        f.manager
            .handle_packet(&handle, data(&f, &Message::notify("bad-route", b"x".to_vec())));
        assert!(conn.take_packets().is_empty());
    }

    #[tokio::test]
    async fn test_routing_errors_become_error_responses() {
        let f = fixture(options());
        let (conn, handle) = establish(&f, "c1");
        f.manager
            .handle_packet(&handle, data(&f, &Message::request(1, "local.mod", vec![])));
        f.manager
            .handle_packet(&handle, data(&f, &Message::request(2, "local.mod.missing", vec![])));
        f.manager
            .handle_packet(&handle, data(&f, &Message::request(3, "remote.mod.method", vec![])));

        let messages = conn.take_messages(f.manager.codec());
        let codes: Vec<(u64, u16)> = messages.iter().map(|m| (m.id, error_code(m))).collect();
        assert_eq!(codes, vec![(1, 400), (2, 404), (3, 503)]);
        assert_eq!(conn.state(), ConnectionState::Established);
    }

    #[tokio::test]
    async fn test_local_bind_indexes_user() {
        let f = fixture(options());
        let (conn, handle) = establish(&f, "c1");
        f.manager
            .handle_packet(&handle, data(&f, &Message::request(1, "local.mod.login", b"u1".to_vec())));

        assert_eq!(conn.take_messages(f.manager.codec())[0].payload, b"welcome");
        assert_eq!(f.locator.locate("u1").as_deref(), Some("gate-1"));
        assert_eq!(f.manager.connection_by_user("u1").map(|c| c.id().to_string()).as_deref(), Some("c1"));
        assert_eq!(conn.session().get("level"), Some(json!(1)));

        f.manager.disconnect("c1");
        assert_eq!(f.locator.locate("u1"), None);
        assert!(f.manager.connection_by_user("u1").is_none());
    }

    #[tokio::test]
    async fn test_closing_replaced_connection_keeps_user_located() {
        let f = fixture(options());
        let (_old, old) = establish(&f, "c1");
        let (_new, new) = establish(&f, "c2");
        let login = |n| data(&f, &Message::request(n, "local.mod.login", b"u1".to_vec()));
        f.manager.handle_packet(&old, login(1));
        f.manager.handle_packet(&new, login(2));

        f.manager.disconnect("c1");
        assert_eq!(f.locator.locate("u1").as_deref(), Some("gate-1"));
        assert_eq!(f.manager.connection_by_user("u1").map(|c| c.id().to_string()).as_deref(), Some("c2"));

        f.manager.disconnect("c2");
        assert_eq!(f.locator.locate("u1"), None);
    }

    #[tokio::test]
    async fn test_unknown_route_code_fails_only_the_message() {
        let f = fixture(options());
        let (conn, handle) = establish(&f, "c1");
        // Request id 5 naming route code 0x63, which the dictionary lacks.
        let unknown = vec![0x01, 0x05, 0x00, 0x63, b'x'];
        f.manager
            .handle_packet(&handle, Packet::new(PacketType::Data, unknown));

        let messages = conn.take_messages(f.manager.codec());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, 5);
        assert_eq!(error_code(&messages[0]), 404);
        assert_eq!(conn.state(), ConnectionState::Established);

        // The same code on a notify is dropped silently.
        f.manager
            .handle_packet(&handle, Packet::new(PacketType::Data, vec![0x03, 0x00, 0x63]));
        assert!(conn.take_packets().is_empty());

        f.manager
            .handle_packet(&handle, data(&f, &Message::request(6, "local.mod.echo", b"ok".to_vec())));
        assert_eq!(conn.take_messages(f.manager.codec()), vec![Message::response(6, b"ok".to_vec())]);
    }

    #[tokio::test]
    async fn test_broken_message_framing_closes() {
        let f = fixture(options());
        let (conn, handle) = establish(&f, "c1");
        // Kind bits 7 are unassigned.
        f.manager
            .handle_packet(&handle, Packet::new(PacketType::Data, vec![0x0E, 0x01]));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(f.manager.connection("c1").is_none());
    }

    #[tokio::test]
    async fn test_remote_request_round_trip() {
        let f = fixture(options());
        let mut backend_rx = f.bus.subscribe("remote-1", 8).unwrap();
        f.instances.send_replace(ResolverState {
            addresses: vec![Address {
                address: "remote-1".into(),
                attributes: Attributes { weight: 1 },
            }],
        });

        let (conn, handle) = establish(&f, "c1");
        conn.session()
            .put("room", json!(9), Scope::Connection)
            .unwrap();
        f.manager
            .handle_packet(&handle, data(&f, &Message::request(77, "remote.mod.method", b"q".to_vec())));
        assert!(conn.take_packets().is_empty());

        let forwarded = Envelope::decode(&backend_rx.try_recv().unwrap()).unwrap();
        assert_eq!(forwarded.source, "gate-1");
        assert_eq!(forwarded.connection_id, "c1");
        assert_eq!(forwarded.session.single["room"], json!(9));
        assert_eq!(forwarded.message.as_ref().map(|m| m.id), Some(77));

        let mut reply = Envelope::message("remote-1", "gate-1", Message::response(77, b"a".to_vec()));
        reply.connection_id = "c1".into();
        f.manager.handle_envelope(reply);
        let messages = conn.take_messages(f.manager.codec());
        assert_eq!(messages, vec![Message::response(77, b"a".to_vec())]);
    }

    #[tokio::test]
    async fn test_session_sync_merges_and_binds() {
        let f = fixture(options());
        let (conn, _handle) = establish(&f, "c1");
        let (other, _other_handle) = establish(&f, "c2");

        let mut changes = SessionData::default();
        changes.single.insert("room".into(), json!(5));
        changes.shared.insert("online".into(), json!(2));
        f.manager
            .handle_envelope(Envelope::session_sync("remote-1", "gate-1", "c1", "u7", changes));

        assert_eq!(conn.session().get("room"), Some(json!(5)));
        assert_eq!(other.session().get("online"), Some(json!(2)));
        assert_eq!(other.session().get("room"), None);
        assert_eq!(conn.session().user_id(), "u7");
        assert_eq!(f.locator.locate("u7").as_deref(), Some("gate-1"));

        f.manager.handle_envelope(Envelope::session_sync(
            "remote-1",
            "gate-1",
            "gone",
            "",
            SessionData::default(),
        ));
    }

    #[tokio::test]
    async fn test_push_to_users_and_to_connection() {
        let f = fixture(options());
        let (a, a_handle) = establish(&f, "c1");
        let (b, b_handle) = establish(&f, "c2");
        let (c, _c_handle) = establish(&f, "c3");
        f.manager
            .handle_packet(&a_handle, data(&f, &Message::request(1, "local.mod.login", b"u1".to_vec())));
        f.manager
            .handle_packet(&b_handle, data(&f, &Message::request(1, "local.mod.login", b"u2".to_vec())));
        a.take_packets();
        b.take_packets();

        let mut push = Envelope::message("game-1", "gate-1", Message::push("onChat", b"hi".to_vec()));
        push.users = vec!["u1".into(), "u2".into(), "ghost".into()];
        f.manager.handle_envelope(push);

        let expected = vec![Message::push("onChat", b"hi".to_vec())];
        assert_eq!(a.take_messages(f.manager.codec()), expected);
        assert_eq!(b.take_messages(f.manager.codec()), expected);
        assert!(c.take_packets().is_empty());

        let mut direct = Envelope::message("game-1", "gate-1", Message::push("onTick", vec![]));
        direct.connection_id = "c3".into();
        f.manager.handle_envelope(direct);
        assert_eq!(c.take_messages(f.manager.codec()).len(), 1);
    }

    #[tokio::test]
    async fn test_manager_push_goes_through_fanout() {
        let mut f = fixture(options());
        let (a, a_handle) = establish(&f, "c1");
        f.manager
            .handle_packet(&a_handle, data(&f, &Message::request(1, "local.mod.login", b"u1".to_vec())));
        a.take_packets();

        assert_eq!(f.manager.push(&["u1".to_string()], "onChat", b"x"), 1);
        let envelope = Envelope::decode(&f.gateway_rx.try_recv().unwrap()).unwrap();
        assert_eq!(envelope.users, vec!["u1".to_string()]);

        f.manager.handle_envelope(envelope);
        assert_eq!(a.take_messages(f.manager.codec()).len(), 1);
    }

    #[tokio::test]
    async fn test_kick_sends_reason_and_removes() {
        let f = fixture(options());
        let (conn, _handle) = establish(&f, "c1");
        f.manager.kick("c1", "maintenance").unwrap();

        let packets = conn.take_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].kind, PacketType::Kick);
        let body: KickBody = serde_json::from_slice(&packets[0].body).unwrap();
        assert_eq!(body.reason, "maintenance");
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            f.manager.kick("c1", "again"),
            Err(GatewayError::UnknownConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_handshake_timeout_kicks() {
        let f = fixture(GatewayOptions {
            handshake_timeout: Duration::from_millis(30),
            ..options()
        });
        let (slow, _slow_handle) = connect(&f, "slow");
        let (_fast, _fast_handle) = establish(&f, "fast");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(slow.state(), ConnectionState::Closed);
        assert_eq!(slow.take_packets()[0].kind, PacketType::Kick);
        assert!(f.manager.connection("fast").is_some());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let f = fixture(GatewayOptions {
            max_connections: 1,
            ..options()
        });
        connect(&f, "c1");
        let extra: Arc<dyn Connection> =
            Arc::new(RecordingConnection::new("c2", Arc::clone(f.manager.shared())));
        assert!(matches!(
            f.manager.attach(extra),
            Err(GatewayError::LimitReached(1))
        ));
    }

    #[tokio::test]
    async fn test_close_disconnects_everything() {
        let f = fixture(options());
        let (a, _a_handle) = establish(&f, "c1");
        f.manager.close();
        assert!(f.manager.is_closed());
        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(f.manager.connection_count(), 0);
        assert!(f.manager.timers.is_empty());
    }
}
