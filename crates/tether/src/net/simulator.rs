use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use super::socket::PacketSocket;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Switch {
    queues: HashMap<SocketAddr, VecDeque<Datagram>>,
    blackholed: HashSet<SocketAddr>,
    log: Vec<Datagram>,
}

/// Deterministic in-process network. Every [`MemorySocket`] created from the
/// same network shares one switch; delivery happens only when the receiving
/// side polls, so tests fully control ordering and loss.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    switch: Rc<RefCell<Switch>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn socket(&self, addr: SocketAddr) -> MemorySocket {
        self.switch.borrow_mut().queues.entry(addr).or_default();
        MemorySocket {
            addr,
            network: self.clone(),
        }
    }

    /// Datagrams sent to `addr` are logged but never delivered.
    pub fn set_blackholed(&self, addr: SocketAddr, blackholed: bool) {
        let mut switch = self.switch.borrow_mut();
        if blackholed {
            switch.blackholed.insert(addr);
        } else {
            switch.blackholed.remove(&addr);
        }
    }

    /// Removes everything queued for `addr` so a test can drop, reorder or
    /// duplicate it before handing it back with [`deliver`](Self::deliver).
    pub fn intercept(&self, addr: SocketAddr) -> Vec<Datagram> {
        self.switch
            .borrow_mut()
            .queues
            .get_mut(&addr)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn deliver(&self, datagrams: impl IntoIterator<Item = Datagram>) {
        let mut switch = self.switch.borrow_mut();
        for datagram in datagrams {
            switch
                .queues
                .entry(datagram.to)
                .or_default()
                .push_back(datagram);
        }
    }

    pub fn inject(&self, from: SocketAddr, to: SocketAddr, data: Vec<u8>) {
        self.deliver([Datagram { from, to, data }]);
    }

    /// Every datagram sent from `addr`, delivered or not, in send order.
    pub fn sent_from(&self, addr: SocketAddr) -> Vec<Datagram> {
        self.switch
            .borrow()
            .log
            .iter()
            .filter(|d| d.from == addr)
            .cloned()
            .collect()
    }

    pub fn pending_for(&self, addr: SocketAddr) -> usize {
        self.switch
            .borrow()
            .queues
            .get(&addr)
            .map_or(0, VecDeque::len)
    }

    pub fn clear_log(&self) {
        self.switch.borrow_mut().log.clear();
    }
}

#[derive(Debug)]
pub struct MemorySocket {
    addr: SocketAddr,
    network: MemoryNetwork,
}

impl PacketSocket for MemorySocket {
    fn poll(&mut self) -> io::Result<bool> {
        Ok(self.network.pending_for(self.addr) > 0)
    }

    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<(SocketAddr, usize)> {
        let mut switch = self.network.switch.borrow_mut();
        let datagram = switch
            .queues
            .get_mut(&self.addr)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;

        let len = datagram.data.len().min(buffer.len());
        buffer[..len].copy_from_slice(&datagram.data[..len]);
        Ok((datagram.from, len))
    }

    fn send(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<usize> {
        let mut switch = self.network.switch.borrow_mut();
        let datagram = Datagram {
            from: self.addr,
            to: addr,
            data: data.to_vec(),
        };
        switch.log.push(datagram.clone());

        if !switch.blackholed.contains(&addr) {
            switch.queues.entry(addr).or_default().push_back(datagram);
        }
        Ok(data.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}
