use std::net::SocketAddr;

use crate::error::Error;
use crate::net::{ConnectionHandle, DenyReason, Reliability};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called on this side.
    Local,
    /// The remote side sent a disconnect notice.
    Remote,
    /// Nothing was received for `disconnect_timeout`.
    Timeout,
    /// The peer was closed.
    Closed,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Local => "disconnected",
            DisconnectReason::Remote => "disconnected by remote",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Closed => "peer closed",
        }
    }
}

/// Notifications raised by a [`Peer`](crate::Peer) and drained by the
/// application once per tick.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake completed. On a listening peer this is the accept
    /// notification for a new client.
    Connected(ConnectionHandle),
    /// Raised by [`Peer::authenticate`](crate::Peer::authenticate).
    Authenticated(ConnectionHandle),
    /// A connection that had reached `Connected` is gone.
    Disconnected {
        handle: ConnectionHandle,
        reason: DisconnectReason,
    },
    /// A local `connect` never completed.
    ConnectFailed {
        handle: ConnectionHandle,
        error: Error,
    },
    /// A validated request was turned away at admission.
    Rejected { addr: SocketAddr, reason: DenyReason },
    Message {
        handle: ConnectionHandle,
        reliability: Reliability,
        payload: Vec<u8>,
    },
}

impl PeerEvent {
    pub fn handle(&self) -> Option<ConnectionHandle> {
        match self {
            Self::Connected(handle) | Self::Authenticated(handle) => Some(*handle),
            Self::Disconnected { handle, .. }
            | Self::ConnectFailed { handle, .. }
            | Self::Message { handle, .. } => Some(*handle),
            Self::Rejected { .. } => None,
        }
    }
}
