use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::protocol::{REORDER_WINDOW, sequence_greater_than};

#[derive(Debug, Clone)]
pub struct InFlight {
    pub sequence: u32,
    pub payload: Vec<u8>,
    pub first_send_time: Instant,
    pub last_send_time: Instant,
    pub resends: u32,
}

/// Outbound half of the reliable channel: assigns sequence numbers, keeps
/// unacknowledged payloads for retransmission and estimates round-trip time.
#[derive(Debug)]
pub struct SendWindow {
    pending: VecDeque<InFlight>,
    next_sequence: u32,
    max_pending: usize,
    highest_acked: Option<u32>,
    srtt: f32,
    rtt_var: f32,
}

impl SendWindow {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(max_pending.min(256)),
            next_sequence: 0,
            max_pending,
            highest_acked: None,
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }

    /// Returns `None` when the window is full; the caller decides whether that
    /// is an error.
    pub fn push(&mut self, payload: Vec<u8>, now: Instant) -> Option<u32> {
        if self.pending.len() >= self.max_pending {
            return None;
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        self.pending.push_back(InFlight {
            sequence,
            payload,
            first_send_time: now,
            last_send_time: now,
            resends: 0,
        });

        Some(sequence)
    }

    /// Applies a cumulative ack with its out-of-order bitfield and returns the
    /// sequences that were released.
    pub fn acknowledge(&mut self, next_expected: u32, window: u32, now: Instant) -> Vec<u32> {
        let mut acked = Vec::new();
        let mut rtt_samples = Vec::new();

        self.pending.retain(|entry| {
            let is_acked = if sequence_greater_than(next_expected, entry.sequence) {
                true
            } else {
                let offset = entry.sequence.wrapping_sub(next_expected);
                offset >= 1 && offset <= REORDER_WINDOW && window & (1 << (offset - 1)) != 0
            };

            if is_acked {
                acked.push(entry.sequence);
                // Karn: ambiguous samples from retransmitted frames are skipped.
                if entry.resends == 0 {
                    let rtt = now.duration_since(entry.first_send_time).as_secs_f32() * 1000.0;
                    rtt_samples.push(rtt);
                }
            }
            !is_acked
        });

        for rtt in rtt_samples {
            self.update_rtt(rtt);
        }

        for &sequence in &acked {
            if self
                .highest_acked
                .is_none_or(|current| sequence_greater_than(sequence, current))
            {
                self.highest_acked = Some(sequence);
            }
        }

        acked
    }

    /// Entries whose last transmission is at least `resend_after` old. Their
    /// send time and resend counter are updated as they are returned.
    pub fn due_for_resend(&mut self, now: Instant, resend_after: Duration) -> Vec<(u32, Vec<u8>)> {
        let mut due = Vec::new();
        for entry in &mut self.pending {
            if now.duration_since(entry.last_send_time) >= resend_after {
                entry.last_send_time = now;
                entry.resends += 1;
                due.push((entry.sequence, entry.payload.clone()));
            }
        }
        due
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn highest_acked(&self) -> Option<u32> {
        self.highest_acked
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.max_pending
    }

    pub fn capacity(&self) -> usize {
        self.max_pending
    }
}

/// What happened to an inbound reliable frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    /// In order; carries the payload and any buffered successors it released.
    Delivered(Vec<Vec<u8>>),
    /// Ahead of a gap but inside the window; held until the gap fills.
    Buffered,
    /// Already delivered or already buffered.
    Duplicate,
    /// Too far ahead to buffer; dropped without acknowledgment.
    OutOfWindow,
}

/// Inbound half of the reliable channel. Delivers payloads strictly in
/// sequence order and produces cumulative acks.
#[derive(Debug, Default)]
pub struct ReceiveWindow {
    next_expected: u32,
    buffered: HashMap<u32, Vec<u8>>,
}

impl ReceiveWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sequence: u32, payload: Vec<u8>) -> Arrival {
        let offset = sequence.wrapping_sub(self.next_expected);

        if offset > SEQUENCE_WRAP_BEHIND {
            return Arrival::Duplicate;
        }
        if offset > REORDER_WINDOW {
            return Arrival::OutOfWindow;
        }
        if offset > 0 {
            if self.buffered.contains_key(&sequence) {
                return Arrival::Duplicate;
            }
            self.buffered.insert(sequence, payload);
            return Arrival::Buffered;
        }

        let mut delivered = vec![payload];
        self.next_expected = self.next_expected.wrapping_add(1);
        while let Some(next) = self.buffered.remove(&self.next_expected) {
            delivered.push(next);
            self.next_expected = self.next_expected.wrapping_add(1);
        }

        Arrival::Delivered(delivered)
    }

    pub fn ack_data(&self) -> (u32, u32) {
        let mut window = 0u32;
        for bit in 0..REORDER_WINDOW {
            let sequence = self.next_expected.wrapping_add(bit + 1);
            if self.buffered.contains_key(&sequence) {
                window |= 1 << bit;
            }
        }
        (self.next_expected, window)
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }
}

// Offsets this far past `next_expected` are really sequences behind it.
const SEQUENCE_WRAP_BEHIND: u32 = u32::MAX / 2;
