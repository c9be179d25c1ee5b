use std::collections::VecDeque;

use super::types::PeerEvent;
use crate::net::Reliability;

/// FIFO of pending notifications. Once `max_pending` is reached the oldest
/// unreliable message is dropped to make room. Reliable messages and
/// lifecycle events are never evicted; the owning peer stops reading its
/// socket while the queue [`is_full`](Self::is_full) instead.
#[derive(Debug)]
pub struct EventQueue {
    pending: VecDeque<PeerEvent>,
    max_pending: usize,
    dropped_messages: u64,
}

impl EventQueue {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(max_pending.min(1024)),
            max_pending,
            dropped_messages: 0,
        }
    }

    pub fn push(&mut self, event: PeerEvent) {
        if self.is_full() {
            self.evict_oldest_unreliable();
        }
        self.pending.push_back(event);
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PeerEvent> + '_ {
        self.pending.drain(..)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.max_pending
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages
    }

    fn evict_oldest_unreliable(&mut self) {
        if let Some(idx) = self.pending.iter().position(|e| {
            matches!(
                e,
                PeerEvent::Message {
                    reliability: Reliability::Unreliable,
                    ..
                }
            )
        }) {
            self.pending.remove(idx);
            self.dropped_messages += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ConnectionHandle;

    fn handle() -> ConnectionHandle {
        ConnectionHandle {
            id: 1,
            addr: "127.0.0.1:9000".parse().unwrap(),
        }
    }

    fn message(reliability: Reliability, byte: u8) -> PeerEvent {
        PeerEvent::Message {
            handle: handle(),
            reliability,
            payload: vec![byte],
        }
    }

    #[test]
    fn overflow_evicts_unreliable_messages_first() {
        let mut queue = EventQueue::new(2);

        queue.push(PeerEvent::Connected(handle()));
        queue.push(message(Reliability::Unreliable, 1));
        queue.push(message(Reliability::Unreliable, 2));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_messages(), 1);

        let events: Vec<_> = queue.drain().collect();
        assert!(matches!(events[0], PeerEvent::Connected(_)));
        assert!(matches!(&events[1], PeerEvent::Message { payload, .. } if payload == &vec![2]));
        assert!(queue.is_empty());
    }

    #[test]
    fn lifecycle_events_are_kept() {
        let mut queue = EventQueue::new(1);

        queue.push(PeerEvent::Connected(handle()));
        queue.push(PeerEvent::Authenticated(handle()));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_messages(), 0);
    }

    #[test]
    fn reliable_messages_are_never_evicted() {
        let mut queue = EventQueue::new(2);

        queue.push(message(Reliability::Reliable, 1));
        queue.push(message(Reliability::Unreliable, 2));
        assert!(queue.is_full());
        queue.push(message(Reliability::Reliable, 3));
        queue.push(message(Reliability::Reliable, 4));

        assert_eq!(queue.dropped_messages(), 1);
        let payloads: Vec<u8> = queue
            .drain()
            .filter_map(|e| match e {
                PeerEvent::Message { payload, .. } => Some(payload[0]),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![1, 3, 4]);
    }
}
