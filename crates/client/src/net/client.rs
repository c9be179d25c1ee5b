use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tether::{
    ChatMessage, ConnectionHandle, Error, MessageReceiver, MessageSender, PacketSocket, Peer,
    PeerEvent, PingMessage, PongMessage, Reliability, UdpPacketSocket,
};

use super::config::ClientConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
    Failed,
    Disconnected,
}

/// What the message handlers feed back into the client.
#[derive(Debug, Default)]
struct Inbox {
    chat: VecDeque<ChatMessage>,
    pong_timestamps: Vec<u64>,
}

pub struct ChatClient<S: PacketSocket> {
    peer: Peer<S>,
    config: ClientConfig,
    state: ClientState,
    server: Option<ConnectionHandle>,
    receiver: MessageReceiver<Inbox>,
    inbox: Inbox,
    unsent: VecDeque<String>,
    epoch: Instant,
    last_ping_time: Instant,
    last_rtt: Option<Duration>,
    failure: Option<Error>,
}

impl ChatClient<UdpPacketSocket> {
    /// Client on an ephemeral local UDP port.
    pub fn bind(config: ClientConfig) -> tether::Result<Self> {
        Self::new(UdpPacketSocket::bind("0.0.0.0:0")?, config)
    }
}

impl<S: PacketSocket> ChatClient<S> {
    pub fn new(socket: S, config: ClientConfig) -> tether::Result<Self> {
        let mut peer = Peer::new(socket, config.peer.clone())?;
        if let Some(secret) = &config.secret {
            peer = peer.with_connect_token(secret.as_bytes());
        }

        let mut receiver = MessageReceiver::new();
        receiver.register::<ChatMessage, _>(|inbox: &mut Inbox, _, message| {
            inbox.chat.push_back(message);
        })?;
        receiver.register::<PongMessage, _>(|inbox: &mut Inbox, _, pong| {
            inbox.pong_timestamps.push(pong.timestamp_ms);
        })?;

        let now = Instant::now();
        Ok(Self {
            peer,
            config,
            state: ClientState::Idle,
            server: None,
            receiver,
            inbox: Inbox::default(),
            unsent: VecDeque::new(),
            epoch: now,
            last_ping_time: now,
            last_rtt: None,
            failure: None,
        })
    }

    pub fn connect(&mut self, server_addr: SocketAddr, now: Instant) -> tether::Result<()> {
        log::info!("Connecting to {}", server_addr);

        let handle = self.peer.connect(server_addr, now)?;
        self.server = Some(handle);
        self.state = ClientState::Connecting;
        self.failure = None;
        Ok(())
    }

    /// Queues a chat line; lines said before the handshake completes go out
    /// in order once it does.
    pub fn say(&mut self, text: impl Into<String>, now: Instant) {
        self.unsent.push_back(text.into());
        if self.state == ClientState::Connected {
            self.flush_unsent(now);
        }
    }

    /// One pass: socket, timers, notifications, periodic ping.
    pub fn update(&mut self, now: Instant) {
        self.peer.receive(now);
        self.peer.update(now);
        self.handle_peer_events(now);

        if self.state == ClientState::Connected
            && now.saturating_duration_since(self.last_ping_time) >= self.config.ping_interval
        {
            self.send_ping(now);
            self.last_ping_time = now;
        }
    }

    pub fn disconnect(&mut self, now: Instant) {
        if let Some(handle) = self.server {
            if let Err(e) = self.peer.disconnect(handle, now) {
                log::debug!("Disconnect from {} skipped: {}", handle, e);
            }
        }
        self.peer.update(now);
        self.handle_peer_events(now);
        self.state = ClientState::Disconnected;
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    pub fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    pub fn pending_lines(&self) -> usize {
        self.unsent.len()
    }

    pub fn drain_chat(&mut self) -> impl Iterator<Item = ChatMessage> + '_ {
        self.inbox.chat.drain(..)
    }

    fn handle_peer_events(&mut self, now: Instant) {
        let events: Vec<PeerEvent> = self.peer.drain_events().collect();

        for event in events {
            match event {
                PeerEvent::Connected(handle) if Some(handle) == self.server => {
                    log::info!("Connected to {}", handle.addr);
                    self.state = ClientState::Connected;
                    self.last_ping_time = now;
                    self.flush_unsent(now);
                }
                PeerEvent::ConnectFailed { handle, error } if Some(handle) == self.server => {
                    log::error!("Could not connect to {}: {}", handle.addr, error);
                    self.state = ClientState::Failed;
                    self.server = None;
                    self.failure = Some(error);
                }
                PeerEvent::Disconnected { handle, reason } if Some(handle) == self.server => {
                    log::info!("Server {} {}", handle.addr, reason.as_str());
                    self.state = ClientState::Disconnected;
                    self.server = None;
                }
                PeerEvent::Message {
                    handle, payload, ..
                } => match self.receiver.dispatch(&mut self.inbox, handle, &payload) {
                    Ok(true) => {}
                    Ok(false) => log::debug!("Unhandled message from {}", handle),
                    Err(e) => log::warn!("Undecodable message from {}: {}", handle, e),
                },
                other => log::trace!("Ignoring {:?}", other),
            }
        }

        for sent_ms in std::mem::take(&mut self.inbox.pong_timestamps) {
            let rtt_ms = self.millis_since_epoch(now).saturating_sub(sent_ms);
            log::debug!("Ping RTT: {} ms", rtt_ms);
            self.last_rtt = Some(Duration::from_millis(rtt_ms));
        }
    }

    fn flush_unsent(&mut self, now: Instant) {
        let Some(server) = self.server else {
            return;
        };

        while let Some(text) = self.unsent.pop_front() {
            let message = ChatMessage::new(self.config.name.clone(), text);
            if let Err(e) = self
                .peer
                .send_message(server, &message, Reliability::Reliable, now)
            {
                log::warn!("Chat line not sent: {}", e);
                self.unsent.push_front(message.text);
                break;
            }
        }
    }

    fn send_ping(&mut self, now: Instant) {
        let Some(server) = self.server else {
            return;
        };

        let ping = PingMessage {
            timestamp_ms: self.millis_since_epoch(now),
        };
        if let Err(e) = self
            .peer
            .send_message(server, &ping, Reliability::Unreliable, now)
        {
            log::warn!("Ping failed: {}", e);
        }
    }

    fn millis_since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether::{Config, MemoryNetwork, MemorySocket};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn settle(server: &mut Peer<MemorySocket>, client: &mut ChatClient<MemorySocket>, now: Instant) {
        loop {
            let processed = server.receive(now) + client.peer.receive(now);
            client.handle_peer_events(now);
            if processed == 0 {
                break;
            }
        }
    }

    fn listening(network: &MemoryNetwork, config: Config) -> Peer<MemorySocket> {
        let mut server = Peer::new(network.socket(addr(1)), config).unwrap();
        server.listen();
        server
    }

    fn client(network: &MemoryNetwork) -> ChatClient<MemorySocket> {
        let config = ClientConfig {
            name: "ada".into(),
            ..Default::default()
        };
        ChatClient::new(network.socket(addr(2)), config).unwrap()
    }

    fn chat_at_server(server: &mut Peer<MemorySocket>) -> Vec<ChatMessage> {
        let mut receiver = MessageReceiver::<Vec<ChatMessage>>::new();
        receiver
            .register::<ChatMessage, _>(|seen, _, message| seen.push(message))
            .unwrap();

        let mut seen = Vec::new();
        for event in server.drain_events() {
            if let PeerEvent::Message {
                handle, payload, ..
            } = event
            {
                receiver.dispatch(&mut seen, handle, &payload).unwrap();
            }
        }
        seen
    }

    #[test]
    fn test_client_creation() {
        let network = MemoryNetwork::new();
        let client = client(&network);
        assert_eq!(client.state(), ClientState::Idle);
    }

    #[test]
    fn early_lines_are_sent_after_connect() {
        let network = MemoryNetwork::new();
        let now = Instant::now();
        let mut server = listening(&network, Config::default());
        let mut client = client(&network);

        client.say("first", now);
        client.say("second", now);
        client.connect(addr(1), now).unwrap();
        assert_eq!(client.pending_lines(), 2);

        settle(&mut server, &mut client, now);

        assert!(client.is_connected());
        assert_eq!(client.pending_lines(), 0);
        assert_eq!(
            chat_at_server(&mut server),
            vec![ChatMessage::new("ada", "first"), ChatMessage::new("ada", "second")]
        );
    }

    #[test]
    fn pong_updates_rtt() {
        let network = MemoryNetwork::new();
        let start = Instant::now();
        let mut server = listening(&network, Config::default());
        let mut client = client(&network);
        client.connect(addr(1), start).unwrap();
        settle(&mut server, &mut client, start);

        let to_client = server.connections().next().unwrap().handle();
        server.drain_events().for_each(drop);

        client.send_ping(start);
        settle(&mut server, &mut client, start);
        let pong = PongMessage {
            timestamp_ms: client.millis_since_epoch(start),
        };
        server
            .send_message(to_client, &pong, Reliability::Unreliable, start)
            .unwrap();

        let later = start + Duration::from_millis(30);
        settle(&mut server, &mut client, later);

        assert_eq!(client.last_rtt(), Some(Duration::from_millis(30)));
    }

    #[test]
    fn full_server_marks_client_failed() {
        let network = MemoryNetwork::new();
        let now = Instant::now();
        let mut server = listening(
            &network,
            Config {
                max_connections: 0,
                ..Config::default()
            },
        );
        let mut client = client(&network);

        client.connect(addr(1), now).unwrap();
        settle(&mut server, &mut client, now);
        client.update(now);

        assert_eq!(client.state(), ClientState::Failed);
        assert!(matches!(client.failure(), Some(Error::ServerFull)));
    }
}
