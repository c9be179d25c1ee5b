use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use super::protocol::MAX_PACKET_SIZE;

/// Non-blocking datagram socket consumed by a [`Peer`](crate::Peer).
///
/// `poll` is the only readiness check; `receive` is only called after it
/// returned `true` and must not block.
pub trait PacketSocket {
    fn poll(&mut self) -> io::Result<bool>;

    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<(SocketAddr, usize)>;

    fn send(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// `PacketSocket` over a non-blocking `std::net::UdpSocket`.
///
/// `poll` reads ahead one datagram and parks it until `receive` collects it,
/// which keeps readiness checks portable.
#[derive(Debug)]
pub struct UdpPacketSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    parked: Option<(SocketAddr, usize)>,
    recv_buffer: Box<[u8]>,
}

impl UdpPacketSocket {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            parked: None,
            recv_buffer: vec![0u8; MAX_PACKET_SIZE * 2].into_boxed_slice(),
        })
    }
}

impl PacketSocket for UdpPacketSocket {
    fn poll(&mut self) -> io::Result<bool> {
        if self.parked.is_some() {
            return Ok(true);
        }

        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    self.parked = Some((addr, size));
                    return Ok(true);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                // ICMP port-unreachable from an earlier send surfaces here on
                // some platforms; it says nothing about pending data.
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<(SocketAddr, usize)> {
        if self.parked.is_none() && !self.poll()? {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }

        let Some((addr, size)) = self.parked.take() else {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        };

        let len = size.min(buffer.len());
        buffer[..len].copy_from_slice(&self.recv_buffer[..len]);
        Ok((addr, len))
    }

    fn send(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<usize> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Packet exceeds MTU",
            ));
        }
        self.socket.send_to(data, addr)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn poll_reports_pending_datagram() {
        let mut a = UdpPacketSocket::bind("127.0.0.1:0").unwrap();
        let mut b = UdpPacketSocket::bind("127.0.0.1:0").unwrap();
        let b_addr = b.local_addr().unwrap();

        assert!(!b.poll().unwrap());

        a.send(b_addr, b"hello").unwrap();

        let start = Instant::now();
        while !b.poll().unwrap() {
            assert!(start.elapsed() < Duration::from_secs(1), "datagram never arrived");
            std::thread::sleep(Duration::from_millis(1));
        }

        let mut buffer = [0u8; 64];
        let (from, len) = b.receive(&mut buffer).unwrap();
        assert_eq!(from, a.local_addr().unwrap());
        assert_eq!(&buffer[..len], b"hello");
        assert!(!b.poll().unwrap());
    }
}
