use std::collections::HashMap;
use std::time::Instant;

use log::trace;

use super::codec::{CodecError, MessageTypeId, NetworkMessage, encode_envelope, split_envelope};
use crate::error::{Error, Result};
use crate::net::{ConnectionHandle, PacketSocket, Peer, Reliability};

type Handler<C> = Box<dyn FnMut(&mut C, ConnectionHandle, &[u8]) -> std::result::Result<(), CodecError>>;

/// Registry of typed handlers, one per message type.
///
/// `C` is a context handed to every handler at dispatch time, typically the
/// application state or the [`Peer`] itself so handlers can reply.
pub struct MessageReceiver<C = ()> {
    handlers: HashMap<MessageTypeId, Handler<C>>,
}

impl<C> Default for MessageReceiver<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> MessageReceiver<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Fails with [`Error::DuplicateHandler`] if `M` already has a handler.
    pub fn register<M, F>(&mut self, mut handler: F) -> Result<()>
    where
        M: NetworkMessage + 'static,
        F: FnMut(&mut C, ConnectionHandle, M) + 'static,
    {
        if self.handlers.contains_key(&M::TYPE_ID) {
            return Err(Error::DuplicateHandler(M::TYPE_ID));
        }

        self.handlers.insert(
            M::TYPE_ID,
            Box::new(move |ctx, from, body| {
                let message = M::unpack(body)?;
                handler(ctx, from, message);
                Ok(())
            }),
        );
        Ok(())
    }

    pub fn unregister<M: NetworkMessage>(&mut self) -> bool {
        self.handlers.remove(&M::TYPE_ID).is_some()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn is_registered<M: NetworkMessage>(&self) -> bool {
        self.handlers.contains_key(&M::TYPE_ID)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Decodes `envelope` and runs the matching handler. Returns `Ok(false)`
    /// when no handler is registered for its type.
    pub fn dispatch(
        &mut self,
        ctx: &mut C,
        from: ConnectionHandle,
        envelope: &[u8],
    ) -> std::result::Result<bool, CodecError> {
        let (type_id, body) = split_envelope(envelope)?;

        match self.handlers.get_mut(&type_id) {
            Some(handler) => {
                handler(ctx, from, body)?;
                Ok(true)
            }
            None => {
                trace!("No handler for message type {} from {}", type_id, from);
                Ok(false)
            }
        }
    }
}

/// Sending half of the dispatch pair.
pub trait MessageSender {
    fn send_message<M: NetworkMessage>(
        &mut self,
        to: ConnectionHandle,
        message: &M,
        reliability: Reliability,
        now: Instant,
    ) -> Result<()>;
}

impl<S: PacketSocket> MessageSender for Peer<S> {
    fn send_message<M: NetworkMessage>(
        &mut self,
        to: ConnectionHandle,
        message: &M,
        reliability: Reliability,
        now: Instant,
    ) -> Result<()> {
        let envelope = encode_envelope(message)?;
        self.send(to, envelope, reliability, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChatMessage, PingMessage};

    fn handle() -> ConnectionHandle {
        ConnectionHandle {
            id: 3,
            addr: "127.0.0.1:9100".parse().unwrap(),
        }
    }

    #[test]
    fn dispatches_to_typed_handler() {
        let mut receiver = MessageReceiver::<Vec<String>>::new();
        receiver
            .register::<ChatMessage, _>(|log, from, message| {
                log.push(format!("{}:{}:{}", from.id, message.sender, message.text));
            })
            .unwrap();

        let mut log = Vec::new();
        let envelope = encode_envelope(&ChatMessage::new("bo", "hi")).unwrap();
        assert!(receiver.dispatch(&mut log, handle(), &envelope).unwrap());

        assert_eq!(log, vec!["3:bo:hi".to_string()]);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut receiver = MessageReceiver::<()>::new();
        receiver.register::<PingMessage, _>(|_, _, _| {}).unwrap();

        let err = receiver
            .register::<PingMessage, _>(|_, _, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateHandler(id) if id == PingMessage::TYPE_ID));
        assert_eq!(receiver.len(), 1);
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let mut receiver = MessageReceiver::<()>::new();
        let envelope = encode_envelope(&PingMessage { timestamp_ms: 1 }).unwrap();

        assert!(!receiver.dispatch(&mut (), handle(), &envelope).unwrap());
    }

    #[test]
    fn unregister_and_clear() {
        let mut receiver = MessageReceiver::<u32>::new();
        receiver.register::<PingMessage, _>(|n, _, _| *n += 1).unwrap();
        receiver.register::<ChatMessage, _>(|n, _, _| *n += 10).unwrap();

        let ping = encode_envelope(&PingMessage { timestamp_ms: 1 }).unwrap();
        let chat = encode_envelope(&ChatMessage::new("a", "b")).unwrap();
        let mut count = 0;

        assert!(receiver.unregister::<PingMessage>());
        assert!(!receiver.unregister::<PingMessage>());
        assert!(!receiver.dispatch(&mut count, handle(), &ping).unwrap());
        assert!(receiver.dispatch(&mut count, handle(), &chat).unwrap());
        assert_eq!(count, 10);

        receiver.clear();
        assert!(receiver.is_empty());
        assert!(!receiver.dispatch(&mut count, handle(), &chat).unwrap());

        // re-registering after removal is allowed
        receiver.register::<PingMessage, _>(|n, _, _| *n += 1).unwrap();
        assert!(receiver.is_registered::<PingMessage>());
    }
}
