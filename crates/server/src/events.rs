use std::net::SocketAddr;

use tether::{ConnectionHandle, DenyReason, DisconnectReason};

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientJoined {
        handle: ConnectionHandle,
    },
    ClientLeft {
        handle: ConnectionHandle,
        reason: DisconnectReason,
    },
    ClientDenied {
        addr: SocketAddr,
        reason: DenyReason,
    },
    ChatRelayed {
        from: ConnectionHandle,
        recipients: usize,
    },
    Error {
        message: String,
    },
}
