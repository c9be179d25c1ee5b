use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use log::{debug, info, warn};

use super::protocol::{DenyReason, Frame, max_payload_size};
use super::stats::ConnectionStats;
use super::tracking::{Arrival, ReceiveWindow, SendWindow};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::DisconnectReason;

/// Identifies one incarnation of a connection. The id distinguishes a later
/// connection from the same endpoint after the first one was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub id: u32,
    pub addr: SocketAddr,
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.id, self.addr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Reliable,
    Unreliable,
}

impl Reliability {
    pub fn is_reliable(&self) -> bool {
        matches!(self, Self::Reliable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created by a local `connect`.
    Client,
    /// Created by the listener for an inbound request.
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    AwaitingRequest,
    Requesting,
    Challenged,
    Responding { combined_salt: u64 },
    Complete,
}

/// Per-endpoint session state machine.
///
/// The connection never touches a socket. Frames it wants transmitted are
/// queued in an outbox and application payloads it accepted are queued in an
/// inbox; the owning [`Peer`](crate::Peer) drains both.
#[derive(Debug)]
pub struct Connection {
    handle: ConnectionHandle,
    role: Role,
    state: ConnectionState,
    handshake: Handshake,
    config: Config,
    token: Vec<u8>,
    client_salt: u64,
    server_salt: u64,
    connect_attempts: u32,
    last_attempt_time: Instant,
    last_receive_time: Instant,
    last_send_time: Instant,
    was_connected: bool,
    authenticated: bool,
    send_window: SendWindow,
    receive_window: ReceiveWindow,
    stats: ConnectionStats,
    outbox: VecDeque<Frame>,
    inbox: VecDeque<(Reliability, Vec<u8>)>,
    disconnect_reason: Option<DisconnectReason>,
    failure: Option<Error>,
}

impl Connection {
    fn new(handle: ConnectionHandle, role: Role, config: &Config, now: Instant) -> Self {
        Self {
            handle,
            role,
            state: ConnectionState::Connecting,
            handshake: Handshake::AwaitingRequest,
            config: config.clone(),
            token: Vec::new(),
            client_salt: 0,
            server_salt: 0,
            connect_attempts: 0,
            last_attempt_time: now,
            last_receive_time: now,
            last_send_time: now,
            was_connected: false,
            authenticated: false,
            send_window: SendWindow::new(config.max_in_flight),
            receive_window: ReceiveWindow::new(),
            stats: ConnectionStats::default(),
            outbox: VecDeque::new(),
            inbox: VecDeque::new(),
            disconnect_reason: None,
            failure: None,
        }
    }

    /// Starts an outbound handshake; the first connect request is queued
    /// immediately and counts as attempt one.
    pub fn client(handle: ConnectionHandle, token: Vec<u8>, config: &Config, now: Instant) -> Self {
        let mut conn = Self::new(handle, Role::Client, config, now);
        conn.token = token;
        conn.client_salt = random_salt();
        conn.handshake = Handshake::Requesting;
        conn.connect_attempts = 1;
        conn.queue(conn.handshake_frame(), now);
        conn
    }

    /// Pending server-side connection; it answers once fed a connect request.
    pub fn server(handle: ConnectionHandle, config: &Config, now: Instant) -> Self {
        Self::new(handle, Role::Server, config, now)
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn was_connected(&self) -> bool {
        self.was_connected
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    pub fn last_receive_time(&self) -> Instant {
        self.last_receive_time
    }

    pub fn last_send_time(&self) -> Instant {
        self.last_send_time
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.send_window.in_flight()
    }

    pub fn highest_acked(&self) -> Option<u32> {
        self.send_window.highest_acked()
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason
    }

    pub fn send(&mut self, payload: Vec<u8>, reliability: Reliability, now: Instant) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(Error::InvalidState(self.state));
        }

        let limit = max_payload_size();
        if payload.len() > limit {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }

        let frame = match reliability {
            Reliability::Reliable => {
                let sequence = self
                    .send_window
                    .push(payload.clone(), now)
                    .ok_or(Error::SendWindowFull(self.send_window.capacity()))?;
                Frame::Reliable { sequence, payload }
            }
            Reliability::Unreliable => Frame::Unreliable { payload },
        };

        self.queue(frame, now);
        Ok(())
    }

    /// Applies one inbound frame. Data payloads land in the inbox, control
    /// frames only change internal state.
    pub fn receive(&mut self, frame: Frame, now: Instant) -> Result<()> {
        if self.state == ConnectionState::Disconnected {
            return Err(Error::InvalidState(self.state));
        }
        self.last_receive_time = now;

        match frame {
            Frame::ConnectRequest { client_salt, .. } => self.on_connect_request(client_salt, now),
            Frame::Challenge {
                server_salt,
                challenge,
            } => self.on_challenge(server_salt, challenge, now),
            Frame::ChallengeResponse { combined_salt } => {
                self.on_challenge_response(combined_salt, now)
            }
            Frame::Accepted { connection_id } => self.on_accepted(connection_id),
            Frame::Denied { reason } => self.on_denied(reason),
            Frame::Disconnect => {
                self.on_remote_disconnect();
                Ok(())
            }
            Frame::KeepAlive => {
                self.implicit_accept();
                Ok(())
            }
            Frame::Ack {
                next_expected,
                window,
            } => {
                self.implicit_accept();
                self.require_connected()?;
                self.send_window.acknowledge(next_expected, window, now);
                self.stats.rtt_ms = self.send_window.srtt();
                self.stats.rtt_variance = self.send_window.rtt_var();
                Ok(())
            }
            Frame::Reliable { sequence, payload } => {
                self.implicit_accept();
                self.require_connected()?;
                match self.receive_window.record(sequence, payload) {
                    Arrival::Delivered(payloads) => {
                        for payload in payloads {
                            self.inbox.push_back((Reliability::Reliable, payload));
                        }
                    }
                    Arrival::Buffered | Arrival::Duplicate => {}
                    Arrival::OutOfWindow => {
                        debug!("{}: reliable #{} beyond reorder window", self.handle, sequence);
                        return Ok(());
                    }
                }
                let (next_expected, window) = self.receive_window.ack_data();
                self.queue(
                    Frame::Ack {
                        next_expected,
                        window,
                    },
                    now,
                );
                Ok(())
            }
            Frame::Unreliable { payload } => {
                self.implicit_accept();
                self.require_connected()?;
                self.inbox.push_back((Reliability::Unreliable, payload));
                Ok(())
            }
        }
    }

    /// Timer pass: handshake retries, timeout detection, retransmission and
    /// keep-alives.
    pub fn tick(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Disconnecting => {
                self.state = ConnectionState::Disconnected;
            }
            ConnectionState::Connecting if self.role == Role::Client => {
                self.retry_handshake(now);
            }
            ConnectionState::Connecting => {
                if self.is_timed_out(now) {
                    debug!("{}: pending handshake expired", self.handle);
                    self.finish(DisconnectReason::Timeout);
                }
            }
            ConnectionState::Connected => {
                if self.is_timed_out(now) {
                    info!("{}: timed out", self.handle);
                    self.finish(DisconnectReason::Timeout);
                    return;
                }

                let resend_after = self.config.resend_interval();
                for (sequence, payload) in self.send_window.due_for_resend(now, resend_after) {
                    self.stats.resends += 1;
                    self.queue(Frame::Reliable { sequence, payload }, now);
                }

                if now.saturating_duration_since(self.last_send_time)
                    >= self.config.keep_alive_interval
                {
                    self.stats.keep_alives_sent += 1;
                    self.queue(Frame::KeepAlive, now);
                }
            }
        }
    }

    /// Queues a best-effort disconnect notice and enters `Disconnecting`; the
    /// next tick completes teardown.
    pub fn disconnect(&mut self, now: Instant) -> Result<()> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                self.queue(Frame::Disconnect, now);
                self.state = ConnectionState::Disconnecting;
                self.disconnect_reason.get_or_insert(DisconnectReason::Local);
                Ok(())
            }
            state => Err(Error::InvalidState(state)),
        }
    }

    /// Immediate teardown used when the owning peer closes.
    pub fn shutdown(&mut self, now: Instant) {
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            self.queue(Frame::Disconnect, now);
        }
        self.disconnect_reason.get_or_insert(DisconnectReason::Closed);
        self.state = ConnectionState::Disconnected;
    }

    pub fn drain_outbox(&mut self) -> impl Iterator<Item = Frame> + '_ {
        self.outbox.drain(..)
    }

    pub fn drain_inbox(&mut self) -> impl Iterator<Item = (Reliability, Vec<u8>)> + '_ {
        self.inbox.drain(..)
    }

    pub fn take_failure(&mut self) -> Option<Error> {
        self.failure.take()
    }

    pub(crate) fn set_authenticated(&mut self) {
        self.authenticated = true;
    }

    pub(crate) fn stats_mut(&mut self) -> &mut ConnectionStats {
        &mut self.stats
    }

    fn on_connect_request(&mut self, client_salt: u64, now: Instant) -> Result<()> {
        if self.role != Role::Server {
            return Err(Error::InvalidState(self.state));
        }

        match self.state {
            ConnectionState::Connecting => {
                if self.handshake == Handshake::AwaitingRequest || client_salt != self.client_salt {
                    self.client_salt = client_salt;
                    self.server_salt = random_salt();
                }
                self.handshake = Handshake::Challenged;
                self.queue(
                    Frame::Challenge {
                        server_salt: self.server_salt,
                        challenge: self.combined_salt(),
                    },
                    now,
                );
            }
            ConnectionState::Connected if client_salt == self.client_salt => {
                self.queue(
                    Frame::Accepted {
                        connection_id: self.handle.id,
                    },
                    now,
                );
            }
            _ => {}
        }
        Ok(())
    }

    fn on_challenge(&mut self, server_salt: u64, challenge: u64, now: Instant) -> Result<()> {
        if self.role != Role::Client || self.state != ConnectionState::Connecting {
            return Err(Error::InvalidState(self.state));
        }

        let combined_salt = self.client_salt ^ server_salt;
        if challenge != combined_salt {
            warn!("{}: challenge does not match our salt", self.handle);
            return Ok(());
        }

        if self.handshake != (Handshake::Responding { combined_salt }) {
            self.server_salt = server_salt;
            self.handshake = Handshake::Responding { combined_salt };
            self.connect_attempts = 1;
            self.last_attempt_time = now;
        }
        self.queue(Frame::ChallengeResponse { combined_salt }, now);
        Ok(())
    }

    fn on_challenge_response(&mut self, combined_salt: u64, now: Instant) -> Result<()> {
        if self.role != Role::Server {
            return Err(Error::InvalidState(self.state));
        }

        match (self.state, self.handshake) {
            (ConnectionState::Connecting, Handshake::Challenged)
            | (ConnectionState::Connected, Handshake::Complete) => {}
            _ => return Err(Error::InvalidState(self.state)),
        }

        if combined_salt != self.combined_salt() {
            warn!("{}: invalid challenge response", self.handle);
            return Ok(());
        }

        if self.state == ConnectionState::Connecting {
            self.become_connected();
        }
        self.queue(
            Frame::Accepted {
                connection_id: self.handle.id,
            },
            now,
        );
        Ok(())
    }

    fn on_accepted(&mut self, connection_id: u32) -> Result<()> {
        if self.role != Role::Client {
            return Err(Error::InvalidState(self.state));
        }
        if let Handshake::Responding { .. } = self.handshake {
            if self.state == ConnectionState::Connecting {
                debug!("{}: accepted as remote #{}", self.handle, connection_id);
                self.become_connected();
            }
        }
        Ok(())
    }

    fn on_denied(&mut self, reason: DenyReason) -> Result<()> {
        if self.role != Role::Client || self.state != ConnectionState::Connecting {
            return Err(Error::InvalidState(self.state));
        }
        info!("{}: connection denied ({:?})", self.handle, reason);
        self.fail(match reason {
            DenyReason::ServerFull => Error::ServerFull,
        });
        Ok(())
    }

    fn on_remote_disconnect(&mut self) {
        match (self.state, self.role) {
            (ConnectionState::Connected, _) | (ConnectionState::Connecting, Role::Server) => {
                debug!("{}: remote disconnect", self.handle);
                self.disconnect_reason = Some(DisconnectReason::Remote);
                self.state = ConnectionState::Disconnecting;
            }
            _ => {}
        }
    }

    // A client that answered the challenge and then hears from the server has
    // been accepted even if the `Accepted` frame itself was lost.
    fn implicit_accept(&mut self) {
        if self.role == Role::Client
            && self.state == ConnectionState::Connecting
            && matches!(self.handshake, Handshake::Responding { .. })
        {
            self.become_connected();
        }
    }

    fn become_connected(&mut self) {
        info!("{}: connected", self.handle);
        self.state = ConnectionState::Connected;
        self.handshake = Handshake::Complete;
        self.was_connected = true;
    }

    /// The final attempt is not waited out: the first tick after it went out
    /// fails the connection.
    fn retry_handshake(&mut self, now: Instant) {
        if self.connect_attempts >= self.config.max_connect_attempts {
            if now > self.last_attempt_time {
                info!(
                    "{}: no answer after {} handshake attempts",
                    self.handle, self.connect_attempts
                );
                self.fail(Error::ConnectionTimeout {
                    attempts: self.connect_attempts,
                });
            }
            return;
        }

        if now.saturating_duration_since(self.last_attempt_time)
            < self.config.connect_attempt_interval
        {
            return;
        }

        self.connect_attempts += 1;
        self.last_attempt_time = now;
        self.queue(self.handshake_frame(), now);
    }

    fn handshake_frame(&self) -> Frame {
        match self.handshake {
            Handshake::Responding { combined_salt } => Frame::ChallengeResponse { combined_salt },
            _ => Frame::ConnectRequest {
                client_salt: self.client_salt,
                token: self.token.clone(),
            },
        }
    }

    fn require_connected(&self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(Error::InvalidState(self.state))
        }
    }

    fn is_timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_receive_time) > self.config.disconnect_timeout
    }

    fn combined_salt(&self) -> u64 {
        self.client_salt ^ self.server_salt
    }

    fn finish(&mut self, reason: DisconnectReason) {
        self.disconnect_reason.get_or_insert(reason);
        self.state = ConnectionState::Disconnected;
    }

    fn fail(&mut self, error: Error) {
        self.failure = Some(error);
        self.state = ConnectionState::Disconnected;
    }

    fn queue(&mut self, frame: Frame, now: Instant) {
        self.outbox.push_back(frame);
        self.last_send_time = now;
    }
}

fn random_salt() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u128(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default(),
    );
    hasher.finish()
}
