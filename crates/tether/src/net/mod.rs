mod connection;
mod peer;
mod protocol;
mod simulator;
mod socket;
mod stats;
mod tracking;
mod validation;

pub use connection::{Connection, ConnectionHandle, ConnectionState, Reliability, Role};
pub use peer::{MAX_PENDING_EVENTS, Peer, Submission, Submitter};
pub use protocol::{
    DenyReason, Frame, MAX_PACKET_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION, Packet, PacketError,
    PacketHeader, REORDER_WINDOW, max_payload_size, sequence_greater_than,
};
pub use simulator::{Datagram, MemoryNetwork, MemorySocket};
pub use socket::{PacketSocket, UdpPacketSocket};
pub use stats::{ConnectionStats, PeerStats};
pub use tracking::{Arrival, InFlight, ReceiveWindow, SendWindow};
pub use validation::{AcceptAll, SharedSecret, Validator};
