use std::net::SocketAddr;

use super::protocol::{Frame, Packet};

/// Admission hook run over raw datagrams from endpoints that have no
/// connection yet. Returning `false` drops the datagram without any reply.
pub trait Validator {
    fn validate(&self, addr: SocketAddr, datagram: &[u8]) -> bool;
}

impl<F> Validator for F
where
    F: Fn(SocketAddr, &[u8]) -> bool,
{
    fn validate(&self, addr: SocketAddr, datagram: &[u8]) -> bool {
        self(addr, datagram)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Validator for AcceptAll {
    fn validate(&self, _addr: SocketAddr, _datagram: &[u8]) -> bool {
        true
    }
}

/// Admits only connect requests whose token equals the shared secret.
#[derive(Debug, Clone)]
pub struct SharedSecret {
    secret: Vec<u8>,
}

impl SharedSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl Validator for SharedSecret {
    fn validate(&self, _addr: SocketAddr, datagram: &[u8]) -> bool {
        match Packet::deserialize(datagram) {
            Ok(Packet {
                frame: Frame::ConnectRequest { token, .. },
                ..
            }) => constant_time_eq(&token, &self.secret),
            _ => false,
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(token: &[u8]) -> Vec<u8> {
        Packet::new(Frame::ConnectRequest {
            client_salt: 1,
            token: token.to_vec(),
        })
        .serialize()
        .unwrap()
    }

    #[test]
    fn shared_secret_checks_token() {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let validator = SharedSecret::new("hunter2");

        assert!(validator.validate(addr, &request(b"hunter2")));
        assert!(!validator.validate(addr, &request(b"hunter3")));
        assert!(!validator.validate(addr, &request(b"")));
        assert!(!validator.validate(addr, b"garbage"));
    }

    #[test]
    fn closures_are_validators() {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let only_loopback = |addr: SocketAddr, _: &[u8]| addr.ip().is_loopback();

        assert!(only_loopback.validate(addr, &[]));
        assert!(AcceptAll.validate(addr, &[]));
    }
}
