//! Client connections.
//!
//! A [`TcpConnection`] runs three tasks of its own: a writer draining the
//! bounded outbound queue, a ping task sending heartbeats and enforcing
//! the read deadline, and a reader (driven by the manager) that feeds the
//! bounded inbound queue. [`RecordingConnection`] keeps everything it is sent
//! in memory and is used to drive the manager without sockets.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use switchyard_protocol::{
    FrameError, Message, MessageCodec, Packet, PacketType, read_packet, write_buffered,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::GatewayError;
use crate::pool::ConnectionBuffers;
use crate::session::{Session, SharedData};

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted, nothing received yet.
    Connected,
    /// Client handshake received and answered.
    Handshaking,
    /// Client acknowledged the handshake; data may flow.
    Established,
    Closed,
}

/// A client connection as seen by the manager.
pub trait Connection: Send + Sync {
    fn id(&self) -> &str;

    fn session(&self) -> &Arc<Session>;

    fn state(&self) -> ConnectionState;

    fn set_state(&self, state: ConnectionState);

    /// Queue a packet for writing.
    fn send_packet(&self, packet: Packet) -> Result<(), GatewayError>;

    /// Encode `message` with `codec` and queue it as a `Data` packet.
    fn send_message(&self, codec: &MessageCodec, message: &Message) -> Result<(), GatewayError> {
        let body = codec.encode(message)?;
        self.send_packet(Packet::new(PacketType::Data, body))
    }

    /// Stop the connection. Packets already queued are still written.
    fn close(&self);
}

/// Per-connection tuning, derived from the gateway options.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub heartbeat_interval: Duration,
    pub read_deadline: Duration,
    pub outbound_capacity: usize,
    pub max_packet_size: usize,
}

/// A connection over a TCP stream.
pub struct TcpConnection {
    id: String,
    peer: SocketAddr,
    session: Arc<Session>,
    state: Mutex<ConnectionState>,
    outbound: mpsc::Sender<Packet>,
    last_seen: Mutex<Instant>,
    shutdown_tx: watch::Sender<bool>,
    max_packet_size: usize,
    writer: Mutex<Option<JoinHandle<Vec<u8>>>>,
}

impl TcpConnection {
    /// Wrap `stream`, spawning its writer and ping tasks.
    ///
    /// The writer frames packets in `write_buffer` and hands it back through
    /// [`Self::finish_writer`]. The read half is returned to the caller, which
    /// drives [`Self::read_loop`].
    pub fn open(
        id: impl Into<String>,
        stream: TcpStream,
        shared: Arc<SharedData>,
        options: &ConnectionOptions,
        write_buffer: Vec<u8>,
    ) -> std::io::Result<(Arc<Self>, OwnedReadHalf)> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let id = id.into();
        let (outbound, outbound_rx) = mpsc::channel(options.outbound_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        let connection = Arc::new(Self {
            session: Arc::new(Session::new(id.clone(), shared)),
            id,
            peer,
            state: Mutex::new(ConnectionState::Connected),
            outbound,
            last_seen: Mutex::new(Instant::now()),
            shutdown_tx,
            max_packet_size: options.max_packet_size,
            writer: Mutex::new(None),
        });

        let shutdown_rx = connection.shutdown_tx.subscribe();
        let conn_id = connection.id.clone();
        let task = tokio::spawn(async move {
            write_loop(&conn_id, writer, outbound_rx, shutdown_rx, write_buffer).await
        });
        *connection.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        let pinger = Arc::clone(&connection);
        let heartbeat = options.heartbeat_interval;
        let deadline = options.read_deadline;
        tokio::spawn(async move {
            pinger.ping_loop(heartbeat, deadline).await;
        });

        Ok((connection, reader))
    }

    /// Remote address of the client.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Wait for the writer to stop and take back its frame buffer. Only the
    /// first call after [`Connection::close`] gets the buffer.
    pub async fn finish_writer(&self) -> Option<Vec<u8>> {
        let task = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        task.await.ok()
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Read packets until the stream fails or the connection is closed,
    /// handing each to `inbound` in receipt order.
    pub async fn read_loop(
        &self,
        mut reader: OwnedReadHalf,
        buffers: &mut ConnectionBuffers,
        inbound: mpsc::Sender<Packet>,
    ) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return;
        }
        loop {
            tokio::select! {
                result = read_packet(&mut reader, self.max_packet_size, &mut buffers.read) => {
                    match result {
                        Ok(packet) => {
                            self.touch();
                            if inbound.send(packet).await.is_err() {
                                break;
                            }
                        }
                        Err(FrameError::ConnectionClosed) => {
                            tracing::debug!(connection = %self.id, "peer closed the stream");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(connection = %self.id, peer = %self.peer, "read failed: {e}");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }

    async fn ping_loop(&self, heartbeat: Duration, deadline: Duration) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.idle_for() > deadline {
                        tracing::info!(connection = %self.id, "read deadline exceeded");
                        self.close();
                        break;
                    }
                    if self.state() == ConnectionState::Established
                        && let Err(e) = self.send_packet(Packet::new(PacketType::Heartbeat, Vec::new()))
                    {
                        tracing::debug!(connection = %self.id, "heartbeat not queued: {e}");
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }
}

async fn write_loop(
    id: &str,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Packet>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut scratch: Vec<u8>,
) -> Vec<u8> {
    loop {
        tokio::select! {
            biased;
            packet = outbound.recv() => match packet {
                Some(packet) => {
                    if let Err(e) = write_buffered(&mut writer, &packet, &mut scratch).await {
                        tracing::debug!(connection = %id, "write failed: {e}");
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown_rx.changed() => {
                while let Ok(packet) = outbound.try_recv() {
                    if write_buffered(&mut writer, &packet, &mut scratch).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    scratch
}

impl Connection for TcpConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn send_packet(&self, packet: Packet) -> Result<(), GatewayError> {
        if self.state() == ConnectionState::Closed {
            return Err(GatewayError::Closed);
        }
        self.outbound.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => GatewayError::QueueFull(self.id.clone()),
            mpsc::error::TrySendError::Closed(_) => GatewayError::Closed,
        })
    }

    fn close(&self) {
        let previous = std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            ConnectionState::Closed,
        );
        if previous != ConnectionState::Closed {
            let _ = self.shutdown_tx.send(true);
        }
    }
}

/// In-memory connection that records every packet it is sent.
pub struct RecordingConnection {
    id: String,
    session: Arc<Session>,
    state: Mutex<ConnectionState>,
    sent: Mutex<Vec<Packet>>,
}

impl RecordingConnection {
    pub fn new(id: impl Into<String>, shared: Arc<SharedData>) -> Self {
        let id = id.into();
        Self {
            session: Arc::new(Session::new(id.clone(), shared)),
            id,
            state: Mutex::new(ConnectionState::Connected),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Drain the packets sent so far.
    pub fn take_packets(&self) -> Vec<Packet> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Drain the packets sent so far and decode the `Data` ones.
    pub fn take_messages(&self, codec: &MessageCodec) -> Vec<Message> {
        self.take_packets()
            .into_iter()
            .filter(|p| p.kind == PacketType::Data)
            .filter_map(|p| codec.decode(&p.body).ok())
            .collect()
    }
}

impl Connection for RecordingConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn send_packet(&self, packet: Packet) -> Result<(), GatewayError> {
        if self.state() == ConnectionState::Closed {
            return Err(GatewayError::Closed);
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(packet);
        Ok(())
    }

    fn close(&self) {
        self.set_state(ConnectionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use switchyard_protocol::{MAX_PACKET_SIZE, RouteDictionary, write_packet};
    use tokio::net::TcpListener;

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            heartbeat_interval: Duration::from_millis(50),
            read_deadline: Duration::from_millis(200),
            outbound_capacity: 8,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    async fn pair() -> (Arc<TcpConnection>, OwnedReadHalf, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (conn, reader) = TcpConnection::open(
            "c1",
            server,
            Arc::new(SharedData::default()),
            &options(),
            Vec::new(),
        )
        .unwrap();
        (conn, reader, client)
    }

    #[tokio::test]
    async fn test_queued_packets_are_written() {
        let (conn, _reader, mut client) = pair().await;
        conn.send_packet(Packet::new(PacketType::Kick, b"{}".to_vec()))
            .unwrap();

        let mut buf = Vec::new();
        let got = read_packet(&mut client, MAX_PACKET_SIZE, &mut buf).await.unwrap();
        assert_eq!(got.kind, PacketType::Kick);
    }

    #[tokio::test]
    async fn test_reader_feeds_inbound_in_order() {
        let (conn, reader, mut client) = pair().await;
        let (tx, mut rx) = mpsc::channel(4);
        let reader_conn = Arc::clone(&conn);
        let task = tokio::spawn(async move {
            let mut buffers = ConnectionBuffers::default();
            reader_conn.read_loop(reader, &mut buffers, tx).await;
        });

        write_packet(&mut client, &Packet::new(PacketType::Handshake, b"{}".to_vec()))
            .await
            .unwrap();
        write_packet(&mut client, &Packet::new(PacketType::Heartbeat, vec![]))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, PacketType::Handshake);
        assert_eq!(rx.recv().await.unwrap().kind, PacketType::Heartbeat);

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_flushes_then_ends_stream() {
        let (conn, _reader, mut client) = pair().await;
        conn.send_packet(Packet::new(PacketType::Kick, b"{\"reason\":\"bye\"}".to_vec()))
            .unwrap();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.send_packet(Packet::new(PacketType::Heartbeat, vec![])),
            Err(GatewayError::Closed)
        ));

        let mut buf = Vec::new();
        let got = read_packet(&mut client, MAX_PACKET_SIZE, &mut buf).await.unwrap();
        assert_eq!(got.kind, PacketType::Kick);
        assert!(matches!(
            read_packet(&mut client, MAX_PACKET_SIZE, &mut buf).await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_writer_returns_frame_buffer() {
        let (conn, _reader, mut client) = pair().await;
        conn.send_packet(Packet::new(PacketType::Data, vec![7u8; 512]))
            .unwrap();
        let mut buf = Vec::new();
        read_packet(&mut client, MAX_PACKET_SIZE, &mut buf).await.unwrap();

        conn.close();
        let scratch = conn.finish_writer().await.unwrap();
        assert!(scratch.capacity() >= 512);
        assert!(conn.finish_writer().await.is_none());
    }

    #[tokio::test]
    async fn test_silent_client_hits_read_deadline() {
        let (conn, _reader, _client) = pair().await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_established_connection_gets_heartbeats() {
        let (conn, _reader, mut client) = pair().await;
        conn.set_state(ConnectionState::Established);

        let mut buf = Vec::new();
        let got = read_packet(&mut client, MAX_PACKET_SIZE, &mut buf).await.unwrap();
        assert_eq!(got.kind, PacketType::Heartbeat);
    }

    #[test]
    fn test_recording_connection() {
        let conn = RecordingConnection::new("r1", Arc::new(SharedData::default()));
        let codec = MessageCodec::new(Arc::new(RouteDictionary::new()), 0);
        conn.send_message(&codec, &Message::response(4, b"ok".to_vec()))
            .unwrap();
        conn.send_packet(Packet::new(PacketType::Heartbeat, vec![]))
            .unwrap();

        let messages = conn.take_messages(&codec);
        assert_eq!(messages, vec![Message::response(4, b"ok".to_vec())]);
        assert!(conn.take_packets().is_empty());

        conn.close();
        assert!(conn.send_packet(Packet::new(PacketType::Heartbeat, vec![])).is_err());
    }
}
