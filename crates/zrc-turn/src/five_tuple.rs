//! Client/server conversation identity and the allocation table key

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Transport protocol between the client and the TURN listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => f.write_str("UDP"),
            Protocol::Tcp => f.write_str("TCP"),
        }
    }
}

/// The (protocol, client address, server address) triple that identifies
/// one conversation with the server, and therefore at most one allocation.
///
/// A port of `0` marks an address as unset: no bound client or listener
/// socket ever reports it, so [`FiveTuple::default`] is the "empty" tuple
/// that allocation creation rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiveTuple {
    pub protocol: Protocol,
    pub src_addr: SocketAddr,
    pub dst_addr: SocketAddr,
}

impl Default for FiveTuple {
    fn default() -> Self {
        let unset = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0);
        Self {
            protocol: Protocol::Udp,
            src_addr: unset,
            dst_addr: unset,
        }
    }
}

impl FiveTuple {
    pub fn new(protocol: Protocol, src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self {
            protocol,
            src_addr,
            dst_addr,
        }
    }

    /// UDP tuple for a datagram from `src_addr` received on `dst_addr`
    pub fn udp(src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self::new(Protocol::Udp, src_addr, dst_addr)
    }

    pub fn src_is_set(&self) -> bool {
        self.src_addr.port() != 0
    }

    pub fn dst_is_set(&self) -> bool {
        self.dst_addr.port() != 0
    }

    /// Canonical table key for this tuple
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(self.to_string())
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.protocol, self.src_addr, self.dst_addr)
    }
}

/// Deterministic key derived from a [`FiveTuple`].
///
/// `SocketAddr` renders IPv6 addresses in brackets, so the `_`-joined form
/// cannot be produced by two different tuples.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::{IpAddr, Ipv6Addr};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_fingerprint_identical_tuples() {
        let a = FiveTuple::udp(addr("10.0.0.1:5000"), addr("10.0.0.254:3478"));
        let b = FiveTuple::udp(addr("10.0.0.1:5000"), addr("10.0.0.254:3478"));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().as_str(), "UDP_10.0.0.1:5000_10.0.0.254:3478");
    }

    #[test]
    fn test_fingerprint_distinguishes_protocol() {
        let udp = FiveTuple::udp(addr("10.0.0.1:5000"), addr("10.0.0.254:3478"));
        let tcp = FiveTuple::new(Protocol::Tcp, udp.src_addr, udp.dst_addr);
        assert_ne!(udp.fingerprint(), tcp.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_direction() {
        let a = FiveTuple::udp(addr("10.0.0.1:5000"), addr("10.0.0.2:3478"));
        let b = FiveTuple::udp(addr("10.0.0.2:3478"), addr("10.0.0.1:5000"));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_default_is_unset() {
        let tuple = FiveTuple::default();
        assert!(!tuple.src_is_set());
        assert!(!tuple.dst_is_set());

        // Wildcard listener addresses are still set
        let tuple = FiveTuple::udp(addr("192.0.2.7:61000"), addr("0.0.0.0:3478"));
        assert!(tuple.src_is_set());
        assert!(tuple.dst_is_set());
    }

    fn arb_addr() -> impl Strategy<Value = SocketAddr> {
        prop_oneof![
            (any::<[u8; 4]>(), 1u16..=u16::MAX).prop_map(|(ip, port)| SocketAddr::new(IpAddr::from(ip), port)),
            (any::<[u8; 16]>(), 1u16..=u16::MAX).prop_map(|(ip, port)| {
                SocketAddr::new(IpAddr::from(Ipv6Addr::from(ip)), port)
            }),
        ]
    }

    fn arb_tuple() -> impl Strategy<Value = FiveTuple> {
        (any::<bool>(), arb_addr(), arb_addr()).prop_map(|(tcp, src, dst)| {
            let protocol = if tcp { Protocol::Tcp } else { Protocol::Udp };
            FiveTuple::new(protocol, src, dst)
        })
    }

    /// Fingerprints are equal exactly when the tuples are equal
    #[test]
    fn prop_fingerprint_matches_tuple_equality() {
        proptest!(|(a in arb_tuple(), b in arb_tuple())| {
            prop_assert_eq!(a.fingerprint(), a.fingerprint());
            prop_assert_eq!(a == b, a.fingerprint() == b.fingerprint());
        });
    }
}
