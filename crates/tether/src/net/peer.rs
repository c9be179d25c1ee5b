use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc;
use std::time::Instant;

use log::{debug, info, trace, warn};

use super::connection::{Connection, ConnectionHandle, ConnectionState, Reliability, Role};
use super::protocol::{DenyReason, Frame, MAX_PACKET_SIZE, Packet};
use super::socket::{PacketSocket, UdpPacketSocket};
use super::stats::PeerStats;
use super::validation::{AcceptAll, Validator};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{DisconnectReason, EventQueue, PeerEvent};

pub const MAX_PENDING_EVENTS: usize = 4096;

/// An outbound send submitted from another thread.
#[derive(Debug)]
pub struct Submission {
    pub handle: ConnectionHandle,
    pub payload: Vec<u8>,
    pub reliability: Reliability,
}

/// `Send` handle that queues outbound payloads for the thread driving the
/// peer; they go out on the next [`Peer::update`].
#[derive(Debug, Clone)]
pub struct Submitter {
    sender: mpsc::Sender<Submission>,
}

impl Submitter {
    /// Fails only when the peer has been dropped.
    pub fn submit(
        &self,
        handle: ConnectionHandle,
        payload: Vec<u8>,
        reliability: Reliability,
    ) -> std::result::Result<(), Submission> {
        self.sender
            .send(Submission {
                handle,
                payload,
                reliability,
            })
            .map_err(|e| e.0)
    }
}

/// Owns the socket and the connection table, demultiplexes inbound datagrams
/// and drives every connection's timers.
///
/// All methods are synchronous step functions. The application calls
/// [`receive`](Self::receive) and [`update`](Self::update) periodically and
/// drains notifications with [`drain_events`](Self::drain_events).
pub struct Peer<S: PacketSocket> {
    socket: Option<S>,
    config: Config,
    connections: HashMap<SocketAddr, Connection>,
    listening: bool,
    validator: Box<dyn Validator>,
    connect_token: Vec<u8>,
    next_connection_id: u32,
    events: EventQueue,
    stats: PeerStats,
    recv_buffer: Vec<u8>,
    submit_tx: mpsc::Sender<Submission>,
    submit_rx: mpsc::Receiver<Submission>,
}

impl Peer<UdpPacketSocket> {
    /// Binds a UDP socket and starts listening on it.
    pub fn bind<A: ToSocketAddrs>(addr: A, config: Config) -> Result<Self> {
        let socket = UdpPacketSocket::bind(addr)?;
        let mut peer = Self::new(socket, config)?;
        peer.listen();
        Ok(peer)
    }
}

impl<S: PacketSocket> Peer<S> {
    pub fn new(socket: S, config: Config) -> Result<Self> {
        config.validate()?;
        let (submit_tx, submit_rx) = mpsc::channel();

        Ok(Self {
            socket: Some(socket),
            connections: HashMap::new(),
            listening: false,
            validator: Box::new(AcceptAll),
            connect_token: Vec::new(),
            next_connection_id: 1,
            events: EventQueue::new(MAX_PENDING_EVENTS),
            stats: PeerStats::default(),
            recv_buffer: vec![0u8; MAX_PACKET_SIZE * 2],
            submit_tx,
            submit_rx,
            config,
        })
    }

    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    /// Token carried by this peer's outbound connect requests.
    pub fn with_connect_token(mut self, token: impl Into<Vec<u8>>) -> Self {
        self.connect_token = token.into();
        self
    }

    /// Unknown endpoints may open connections from now on.
    pub fn listen(&mut self) {
        self.listening = true;
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket_ref()?.local_addr()?)
    }

    pub fn connection(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.connections
            .get(&handle.addr)
            .filter(|c| c.handle().id == handle.id)
    }

    pub fn connection_by_addr(&self, addr: &SocketAddr) -> Option<&Connection> {
        self.connections.get(addr)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connected_count(&self) -> usize {
        self.connections.values().filter(|c| c.is_connected()).count()
    }

    pub fn submitter(&self) -> Submitter {
        Submitter {
            sender: self.submit_tx.clone(),
        }
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = PeerEvent> + '_ {
        self.events.drain()
    }

    /// Opens a connection to `addr` and sends the first connect request.
    /// Completion is reported through `PeerEvent::Connected` or
    /// `PeerEvent::ConnectFailed`.
    pub fn connect(&mut self, addr: SocketAddr, now: Instant) -> Result<ConnectionHandle> {
        if self.socket.is_none() {
            return Err(Error::Closed);
        }
        if self.connections.contains_key(&addr) {
            return Err(Error::AlreadyConnected(addr));
        }
        if self.connections.len() >= self.config.max_connections {
            return Err(Error::ServerFull);
        }

        let handle = self.next_handle(addr);
        let mut conn = Connection::client(handle, self.connect_token.clone(), &self.config, now);
        let socket = self.socket_mut()?;
        flush(socket, &mut conn)?;

        info!("Connecting to {} as {}", addr, handle);
        self.connections.insert(addr, conn);
        Ok(handle)
    }

    pub fn send(
        &mut self,
        handle: ConnectionHandle,
        payload: Vec<u8>,
        reliability: Reliability,
        now: Instant,
    ) -> Result<()> {
        let Self {
            socket, connections, ..
        } = self;
        let socket = socket.as_mut().ok_or(Error::Closed)?;
        let conn = connections
            .get_mut(&handle.addr)
            .filter(|c| c.handle().id == handle.id)
            .ok_or(Error::UnknownConnection(handle))?;

        conn.send(payload, reliability, now)?;
        flush(socket, conn)
    }

    /// Starts a graceful disconnect. The notice is best-effort; the
    /// connection is finalized on the next `update`.
    pub fn disconnect(&mut self, handle: ConnectionHandle, now: Instant) -> Result<()> {
        let Self {
            socket, connections, ..
        } = self;
        let socket = socket.as_mut().ok_or(Error::Closed)?;
        let conn = connections
            .get_mut(&handle.addr)
            .filter(|c| c.handle().id == handle.id)
            .ok_or(Error::UnknownConnection(handle))?;

        conn.disconnect(now)?;
        if let Err(e) = flush(socket, conn) {
            warn!("Disconnect notice to {} failed: {}", handle, e);
        }
        Ok(())
    }

    /// Marks a connection as authenticated. The policy deciding when to call
    /// this lives with the application.
    pub fn authenticate(&mut self, handle: ConnectionHandle) -> Result<()> {
        let conn = self
            .connections
            .get_mut(&handle.addr)
            .filter(|c| c.handle().id == handle.id)
            .ok_or(Error::UnknownConnection(handle))?;

        if !conn.is_connected() {
            return Err(Error::InvalidState(conn.state()));
        }
        if !conn.is_authenticated() {
            conn.set_authenticated();
            self.events.push(PeerEvent::Authenticated(handle));
        }
        Ok(())
    }

    /// Drains the socket. Returns the number of datagrams processed; socket
    /// errors end the pass but are never fatal. Reading stops early while
    /// [`drain_events`](Self::drain_events) has not made room in a full
    /// event queue.
    pub fn receive(&mut self, now: Instant) -> usize {
        let mut buffer = std::mem::take(&mut self.recv_buffer);
        let mut processed = 0;

        loop {
            // Datagrams left in the socket are not acknowledged yet, so the
            // remote side keeps retransmitting them until there is room.
            if self.events.is_full() {
                debug!("Event queue full; deferring socket reads");
                break;
            }
            let Some(socket) = self.socket.as_mut() else {
                break;
            };

            match socket.poll() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!("Socket poll failed: {}", e);
                    break;
                }
            }

            match socket.receive(&mut buffer) {
                Ok((addr, len)) => {
                    processed += 1;
                    self.stats.datagrams_received += 1;
                    self.handle_datagram(addr, &buffer[..len], now);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Socket receive failed: {}", e);
                    break;
                }
            }
        }

        self.recv_buffer = buffer;
        processed
    }

    /// Timer pass over every connection, then eviction of the ones that
    /// reached `Disconnected`.
    pub fn update(&mut self, now: Instant) {
        self.process_submissions(now);

        if let Some(socket) = self.socket.as_mut() {
            for conn in self.connections.values_mut() {
                conn.tick(now);
                if let Err(e) = flush(socket, conn) {
                    self.stats.send_errors += 1;
                    warn!("Send to {} failed: {}", conn.handle(), e);
                }
            }
        }

        let finished: Vec<SocketAddr> = self
            .connections
            .iter()
            .filter(|(_, c)| c.state() == ConnectionState::Disconnected)
            .map(|(&addr, _)| addr)
            .collect();

        for addr in finished {
            if let Some(conn) = self.connections.remove(&addr) {
                self.finalize(conn);
            }
        }
    }

    /// Tears down every connection (sending best-effort notices) and
    /// releases the socket.
    pub fn close(&mut self, now: Instant) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };

        let connections: Vec<Connection> = self.connections.drain().map(|(_, c)| c).collect();
        for mut conn in connections {
            conn.shutdown(now);
            if let Err(e) = flush(&mut socket, &mut conn) {
                debug!("Close notice to {} failed: {}", conn.handle(), e);
            }
            self.finalize(conn);
        }

        self.listening = false;
        info!("Peer closed");
    }

    fn handle_datagram(&mut self, addr: SocketAddr, data: &[u8], now: Instant) {
        if self.connections.contains_key(&addr) {
            self.route(addr, data, now);
        } else if let Err(e) = self.admit(addr, data, now) {
            debug!("Dropping datagram from unknown {}: {}", addr, e);
        }
    }

    fn route(&mut self, addr: SocketAddr, data: &[u8], now: Instant) {
        let Self {
            socket,
            connections,
            events,
            stats,
            ..
        } = self;
        let (Some(socket), Some(conn)) = (socket.as_mut(), connections.get_mut(&addr)) else {
            return;
        };

        let packet = match Packet::deserialize(data) {
            Ok(packet) => packet,
            Err(e) => {
                conn.stats_mut().malformed += 1;
                warn!("Malformed datagram from {}: {}", conn.handle(), e);
                return;
            }
        };
        conn.stats_mut().record_received(data.len());

        let was_connected = conn.is_connected();
        let kind = packet.frame.kind();
        if let Err(e) = conn.receive(packet.frame, now) {
            debug!("{}: ignored {} frame: {}", conn.handle(), kind, e);
        }

        let handle = conn.handle();
        if !was_connected && conn.is_connected() {
            events.push(PeerEvent::Connected(handle));
        }
        for (reliability, payload) in conn.drain_inbox() {
            events.push(PeerEvent::Message {
                handle,
                reliability,
                payload,
            });
        }

        if let Err(e) = flush(socket, conn) {
            stats.send_errors += 1;
            warn!("Send to {} failed: {}", handle, e);
        }
    }

    /// Turns a connect request from an unknown endpoint into a pending
    /// connection. Errors are never reported to the remote side.
    fn admit(&mut self, addr: SocketAddr, data: &[u8], now: Instant) -> Result<()> {
        if !self.listening {
            self.stats.unsolicited += 1;
            trace!("Dropping datagram from unknown {}", addr);
            return Ok(());
        }

        if !self.validator.validate(addr, data) {
            self.stats.validation_rejected += 1;
            return Err(Error::ValidationRejected);
        }

        let packet = Packet::deserialize(data).inspect_err(|_| self.stats.unsolicited += 1)?;
        let request = match packet.frame {
            frame @ Frame::ConnectRequest { .. } => frame,
            other => {
                self.stats.unsolicited += 1;
                trace!("Dropping {} frame from unknown {}", other.kind(), addr);
                return Ok(());
            }
        };

        if self.connections.len() >= self.config.max_connections {
            self.deny(addr, DenyReason::ServerFull);
            return Ok(());
        }

        let handle = self.next_handle(addr);
        let mut conn = Connection::server(handle, &self.config, now);
        conn.stats_mut().record_received(data.len());
        conn.receive(request, now)?;

        if let Some(socket) = self.socket.as_mut() {
            if let Err(e) = flush(socket, &mut conn) {
                self.stats.send_errors += 1;
                warn!("Challenge to {} failed: {}", handle, e);
            }
        }

        debug!("Connection request from {} admitted as {}", addr, handle);
        self.connections.insert(addr, conn);
        Ok(())
    }

    fn deny(&mut self, addr: SocketAddr, reason: DenyReason) {
        self.stats.denied_full += 1;
        info!("Denying {}: {:?}", addr, reason);

        let sent = Packet::new(Frame::Denied { reason })
            .serialize()
            .map_err(Error::from)
            .and_then(|data| Ok(self.socket_mut()?.send(addr, &data)?));
        if let Err(e) = sent {
            self.stats.send_errors += 1;
            warn!("Denial to {} failed: {}", addr, e);
        }

        self.events.push(PeerEvent::Rejected { addr, reason });
    }

    fn finalize(&mut self, mut conn: Connection) {
        let handle = conn.handle();
        let reason = conn.disconnect_reason().unwrap_or(DisconnectReason::Closed);

        if conn.was_connected() {
            info!("{} {}", handle, reason.as_str());
            self.events.push(PeerEvent::Disconnected { handle, reason });
        } else if conn.role() == Role::Client {
            match conn.take_failure() {
                Some(error) => {
                    info!("Connect to {} failed: {}", handle.addr, error);
                    self.events.push(PeerEvent::ConnectFailed { handle, error });
                }
                None => self.events.push(PeerEvent::Disconnected { handle, reason }),
            }
        } else {
            debug!("Pending connection {} dropped ({})", handle, reason.as_str());
        }
    }

    fn process_submissions(&mut self, now: Instant) {
        while let Ok(submission) = self.submit_rx.try_recv() {
            let handle = submission.handle;
            if let Err(e) = self.send(handle, submission.payload, submission.reliability, now) {
                warn!("Queued send to {} failed: {}", handle, e);
            }
        }
    }

    fn next_handle(&mut self, addr: SocketAddr) -> ConnectionHandle {
        let id = self.next_connection_id;
        self.next_connection_id = self.next_connection_id.wrapping_add(1).max(1);
        ConnectionHandle { id, addr }
    }

    fn socket_ref(&self) -> Result<&S> {
        self.socket.as_ref().ok_or(Error::Closed)
    }

    fn socket_mut(&mut self) -> Result<&mut S> {
        self.socket.as_mut().ok_or(Error::Closed)
    }
}

impl<S: PacketSocket> Drop for Peer<S> {
    fn drop(&mut self) {
        if self.socket.is_some() {
            self.close(Instant::now());
        }
    }
}

/// Writes every queued frame of `conn`. Stops at the first failure so the
/// caller sees the error; frames after it are dropped, which the reliable
/// channel recovers from by retransmission.
fn flush<S: PacketSocket>(socket: &mut S, conn: &mut Connection) -> Result<()> {
    let addr = conn.addr();
    let frames: Vec<Frame> = conn.drain_outbox().collect();

    for frame in frames {
        let data = Packet::new(frame).serialize()?;
        let bytes = socket.send(addr, &data)?;
        conn.stats_mut().record_sent(bytes);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{MemoryNetwork, SharedSecret};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn request(token: &str) -> Vec<u8> {
        Packet::new(Frame::ConnectRequest {
            client_salt: 7,
            token: token.as_bytes().to_vec(),
        })
        .serialize()
        .unwrap()
    }

    #[test]
    fn admission_rejected_by_validator() {
        let network = MemoryNetwork::new();
        let now = Instant::now();
        let mut peer = Peer::new(network.socket(addr(1)), Config::default())
            .unwrap()
            .with_validator(SharedSecret::new("key"));
        peer.listen();

        assert!(matches!(
            peer.admit(addr(2), &request("wrong"), now),
            Err(Error::ValidationRejected)
        ));
        assert_eq!(peer.stats().validation_rejected, 1);
        assert_eq!(peer.connection_count(), 0);
        assert!(network.sent_from(addr(1)).is_empty());

        peer.admit(addr(2), &request("key"), now).unwrap();
        assert_eq!(peer.connection_count(), 1);
        assert_eq!(network.sent_from(addr(1)).len(), 1);
    }

    #[test]
    fn undecodable_request_is_malformed() {
        let network = MemoryNetwork::new();
        let now = Instant::now();
        let mut peer = Peer::new(network.socket(addr(1)), Config::default()).unwrap();
        peer.listen();

        assert!(matches!(
            peer.admit(addr(2), b"junk", now),
            Err(Error::MalformedDatagram(_))
        ));
        assert_eq!(peer.stats().unsolicited, 1);
        assert_eq!(peer.connection_count(), 0);
    }

    #[test]
    fn full_event_queue_defers_reads() {
        let network = MemoryNetwork::new();
        let now = Instant::now();
        let mut peer = Peer::new(network.socket(addr(1)), Config::default()).unwrap();
        peer.listen();

        for _ in 0..MAX_PENDING_EVENTS {
            peer.events.push(PeerEvent::Rejected {
                addr: addr(9),
                reason: DenyReason::ServerFull,
            });
        }
        network.inject(addr(2), addr(1), request(""));

        assert_eq!(peer.receive(now), 0);
        assert_eq!(network.pending_for(addr(1)), 1);

        peer.drain_events().for_each(drop);
        assert_eq!(peer.receive(now), 1);
        assert_eq!(peer.connection_count(), 1);
    }
}
