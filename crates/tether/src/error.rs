use std::io;
use std::net::SocketAddr;

use crate::config::ConfigError;
use crate::message::{CodecError, MessageTypeId};
use crate::net::{ConnectionHandle, ConnectionState, PacketError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection timed out after {attempts} handshake attempts")]
    ConnectionTimeout { attempts: u32 },
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),
    #[error("operation invalid while connection is {0:?}")]
    InvalidState(ConnectionState),
    #[error("server full")]
    ServerFull,
    #[error("datagram rejected by validation hook")]
    ValidationRejected,
    #[error("malformed datagram: {0}")]
    MalformedDatagram(#[from] PacketError),
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
    #[error("no live connection for {0}")]
    UnknownConnection(ConnectionHandle),
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("reliable send window full ({0} frames in flight)")]
    SendWindowFull(usize),
    #[error("handler already registered for message type {0}")]
    DuplicateHandler(MessageTypeId),
    #[error("message codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("peer is closed")]
    Closed,
}
