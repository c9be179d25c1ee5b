#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub resends: u64,
    pub malformed: u64,
    pub keep_alives_sent: u64,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
}

impl ConnectionStats {
    pub fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerStats {
    pub datagrams_received: u64,
    pub validation_rejected: u64,
    pub denied_full: u64,
    pub unsolicited: u64,
    pub send_errors: u64,
}
