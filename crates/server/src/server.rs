use std::collections::VecDeque;
use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};

use tether::{
    ChatMessage, ConnectionHandle, MessageReceiver, MessageSender, PacketSocket, Peer, PeerEvent,
    PingMessage, PongMessage, Reliability, SharedSecret, UdpPacketSocket,
};

use crate::config::ServerConfig;
use crate::events::ServerEvent;

/// Replies produced by message handlers, sent once dispatch is done.
#[derive(Debug)]
enum Outgoing {
    Pong {
        to: ConnectionHandle,
        message: PongMessage,
    },
    Chat {
        from: ConnectionHandle,
        message: ChatMessage,
    },
}

fn handlers() -> tether::Result<MessageReceiver<Vec<Outgoing>>> {
    let mut receiver = MessageReceiver::new();
    receiver.register::<PingMessage, _>(|out: &mut Vec<Outgoing>, from, ping| {
        out.push(Outgoing::Pong {
            to: from,
            message: PongMessage {
                timestamp_ms: ping.timestamp_ms,
            },
        });
    })?;
    receiver.register::<ChatMessage, _>(|out: &mut Vec<Outgoing>, from, message| {
        out.push(Outgoing::Chat { from, message });
    })?;
    Ok(receiver)
}

/// Chat relay: answers pings and forwards chat lines to every other client.
pub struct ChatServer<S: PacketSocket> {
    peer: Peer<S>,
    receiver: MessageReceiver<Vec<Outgoing>>,
    outgoing: Vec<Outgoing>,
    authenticate: bool,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    relayed: u64,
    pending_events: VecDeque<ServerEvent>,
}

impl ChatServer<UdpPacketSocket> {
    pub fn bind<A: ToSocketAddrs>(addr: A, config: ServerConfig) -> tether::Result<Self> {
        let socket = UdpPacketSocket::bind(addr)?;
        Self::new(socket, config)
    }
}

impl<S: PacketSocket> ChatServer<S> {
    pub fn new(socket: S, config: ServerConfig) -> tether::Result<Self> {
        let mut peer = Peer::new(socket, config.peer)?;
        let authenticate = config.secret.is_some();
        if let Some(secret) = config.secret {
            peer = peer.with_validator(SharedSecret::new(secret));
        }
        peer.listen();

        Ok(Self {
            peer,
            receiver: handlers()?,
            outgoing: Vec::new(),
            authenticate,
            tick_duration: Duration::from_secs_f64(1.0 / config.tick_rate.max(1) as f64),
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            relayed: 0,
            pending_events: VecDeque::new(),
        })
    }

    pub fn peer(&self) -> &Peer<S> {
        &self.peer
    }

    pub fn relayed(&self) -> u64 {
        self.relayed
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    /// Runs until `duration` elapses, or forever without one.
    pub fn run(&mut self, duration: Option<Duration>) {
        let started = Instant::now();
        while duration.is_none_or(|d| started.elapsed() < d) {
            self.tick_once();
            for event in self.drain_events().collect::<Vec<_>>() {
                log_event(&event);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown(Instant::now());
    }

    /// Network every call, connection timers at the fixed tick rate.
    pub fn tick_once(&mut self) {
        let now = Instant::now();
        self.accumulator += now - self.last_tick_time;
        self.last_tick_time = now;

        self.process_network(now);

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.update(now);
        }
    }

    pub fn process_network(&mut self, now: Instant) {
        self.peer.receive(now);
        self.handle_peer_events(now);
    }

    pub fn update(&mut self, now: Instant) {
        self.peer.update(now);
        self.handle_peer_events(now);
    }

    pub fn shutdown(&mut self, now: Instant) {
        self.peer.close(now);
        self.handle_peer_events(now);
    }

    fn handle_peer_events(&mut self, now: Instant) {
        let events: Vec<PeerEvent> = self.peer.drain_events().collect();

        for event in events {
            match event {
                PeerEvent::Connected(handle) => {
                    self.pending_events
                        .push_back(ServerEvent::ClientJoined { handle });
                    if self.authenticate {
                        if let Err(e) = self.peer.authenticate(handle) {
                            self.report(format!("Failed to authenticate {}: {}", handle, e));
                        }
                    }
                }
                PeerEvent::Authenticated(handle) => {
                    log::debug!("{} authenticated", handle);
                }
                PeerEvent::Disconnected { handle, reason } => {
                    self.pending_events
                        .push_back(ServerEvent::ClientLeft { handle, reason });
                }
                PeerEvent::Rejected { addr, reason } => {
                    self.pending_events
                        .push_back(ServerEvent::ClientDenied { addr, reason });
                }
                PeerEvent::ConnectFailed { handle, error } => {
                    self.report(format!("Outbound connection {} failed: {}", handle, error));
                }
                PeerEvent::Message {
                    handle, payload, ..
                } => match self.receiver.dispatch(&mut self.outgoing, handle, &payload) {
                    Ok(true) => {}
                    Ok(false) => log::debug!("Unhandled message from {}", handle),
                    Err(e) => log::warn!("Undecodable message from {}: {}", handle, e),
                },
            }
        }

        self.send_outgoing(now);
    }

    fn send_outgoing(&mut self, now: Instant) {
        for outgoing in std::mem::take(&mut self.outgoing) {
            match outgoing {
                Outgoing::Pong { to, message } => {
                    if let Err(e) = self
                        .peer
                        .send_message(to, &message, Reliability::Unreliable, now)
                    {
                        log::warn!("Pong to {} failed: {}", to, e);
                    }
                }
                Outgoing::Chat { from, message } => self.relay(from, &message, now),
            }
        }
    }

    fn relay(&mut self, from: ConnectionHandle, message: &ChatMessage, now: Instant) {
        let recipients: Vec<ConnectionHandle> = self
            .peer
            .connections()
            .filter(|c| c.is_connected() && c.handle() != from)
            .map(|c| c.handle())
            .collect();

        let mut delivered = 0;
        for to in recipients {
            match self
                .peer
                .send_message(to, message, Reliability::Reliable, now)
            {
                Ok(()) => delivered += 1,
                Err(e) => self.report(format!("Relay to {} failed: {}", to, e)),
            }
        }

        self.relayed += 1;
        self.pending_events.push_back(ServerEvent::ChatRelayed {
            from,
            recipients: delivered,
        });
    }

    fn report(&mut self, message: String) {
        self.pending_events.push_back(ServerEvent::Error { message });
    }
}

pub fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::ClientJoined { handle } => log::info!("Client {} joined", handle),
        ServerEvent::ClientLeft { handle, reason } => {
            log::info!("Client {} {}", handle, reason.as_str())
        }
        ServerEvent::ClientDenied { addr, reason } => {
            log::warn!("Connection denied to {}: {:?}", addr, reason)
        }
        ServerEvent::ChatRelayed { from, recipients } => {
            log::debug!("Relayed chat from {} to {} clients", from, recipients)
        }
        ServerEvent::Error { message } => log::error!("{}", message),
    }
}
