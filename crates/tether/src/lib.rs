pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod net;

pub use config::{Config, ConfigError};
pub use error::{Error, Result};
pub use event::{DisconnectReason, EventQueue, PeerEvent};
pub use message::{
    ChatMessage, CodecError, MessageReceiver, MessageSender, MessageTypeId, NetworkMessage,
    PingMessage, PongMessage,
};
pub use net::{
    AcceptAll, Connection, ConnectionHandle, ConnectionState, ConnectionStats, DenyReason,
    MAX_PACKET_SIZE, MemoryNetwork, MemorySocket, PacketSocket, Peer, PeerStats, Reliability,
    Role, SharedSecret, Submitter, UdpPacketSocket, Validator,
};

#[doc(hidden)]
pub use rkyv as __rkyv;
