//! Conversions between wire addresses and host types
//!
//! Wire messages carry addresses as raw bytes ([`BinaryAddress`],
//! [`IpPrefix`]); internally everything is `std::net::IpAddr` and
//! `ipnet::IpNet`. Malformed byte strings convert to `None`, never panic.

use crate::protocol::{BinaryAddress, IpPrefix};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

impl BinaryAddress {
    /// Wrap an address, optionally scoped to an interface
    pub fn from_addr(addr: IpAddr, if_name: Option<String>) -> Self {
        let bytes = match addr {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        Self {
            addr: bytes,
            if_name,
        }
    }

    /// Decode back to an `IpAddr`; `None` if the byte length is wrong
    pub fn to_addr(&self) -> Option<IpAddr> {
        bytes_to_addr(&self.addr)
    }

    /// Is any address set at all?
    pub fn is_set(&self) -> bool {
        !self.addr.is_empty()
    }
}

impl fmt::Display for BinaryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_addr() {
            Some(addr) => match &self.if_name {
                Some(scope) => write!(f, "{}%{}", addr, scope),
                None => write!(f, "{}", addr),
            },
            None => write!(f, "<unset>"),
        }
    }
}

impl IpPrefix {
    /// Build from an `ipnet` network; host bits are preserved so
    /// interface addresses survive the round trip
    pub fn from_ipnet(net: &IpNet) -> Self {
        let bytes = match net {
            IpNet::V4(v4) => v4.addr().octets().to_vec(),
            IpNet::V6(v6) => v6.addr().octets().to_vec(),
        };
        Self {
            prefix_address: bytes,
            prefix_length: net.prefix_len() as i32,
        }
    }

    /// Decode back to an `ipnet` network; `None` on malformed contents
    pub fn to_ipnet(&self) -> Option<IpNet> {
        let addr = bytes_to_addr(&self.prefix_address)?;
        let len = u8::try_from(self.prefix_length).ok()?;
        match addr {
            IpAddr::V4(v4) => Ipv4Net::new(v4, len).ok().map(IpNet::V4),
            IpAddr::V6(v6) => Ipv6Net::new(v6, len).ok().map(IpNet::V6),
        }
    }

    /// Does this prefix cover the given address?
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match self.to_ipnet() {
            Some(net) => net.contains(addr),
            None => false,
        }
    }

    /// Is this an IPv4 prefix?
    pub fn is_v4(&self) -> bool {
        self.prefix_address.len() == 4
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_ipnet() {
            Some(net) => write!(f, "{}", net),
            None => write!(f, "<invalid>/{}", self.prefix_length),
        }
    }
}

fn bytes_to_addr(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(bytes);
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Parse a prefix string into the wire form
pub fn parse_prefix(s: &str) -> Option<IpPrefix> {
    s.parse::<IpNet>().ok().map(|net| IpPrefix::from_ipnet(&net))
}

/// Carve the `index`-th subprefix of length `alloc_len` out of `seed`
///
/// `None` when the index does not fit the space between the seed length
/// and `alloc_len`.
pub fn subprefix_at_index(seed: &IpNet, index: u32, alloc_len: u8) -> Option<IpNet> {
    let seed_len = seed.prefix_len();
    if alloc_len <= seed_len {
        return None;
    }
    let shift_bits = alloc_len - seed_len;
    if shift_bits < 32 && u64::from(index) >= (1u64 << shift_bits) {
        return None;
    }
    match seed {
        IpNet::V4(v4) => {
            if alloc_len > 32 {
                return None;
            }
            let base = u32::from(v4.network());
            let offset = u32::from(index) << (32 - alloc_len);
            let addr = Ipv4Addr::from(base | offset);
            Ipv4Net::new(addr, alloc_len).ok().map(IpNet::V4)
        }
        IpNet::V6(v6) => {
            if alloc_len > 128 {
                return None;
            }
            let base = u128::from(v6.network());
            let offset = u128::from(index) << (128 - alloc_len);
            let addr = Ipv6Addr::from(base | offset);
            Ipv6Net::new(addr, alloc_len).ok().map(IpNet::V6)
        }
    }
}

/// The host address used when programming an allocated prefix onto the
/// loopback: the first address of the prefix, as a full-length network
pub fn loopback_address_of(prefix: &IpNet) -> IpNet {
    match prefix {
        IpNet::V4(v4) => {
            let host = u32::from(v4.network()) | 1;
            IpNet::V4(Ipv4Net::from(Ipv4Addr::from(host)))
        }
        IpNet::V6(v6) => {
            let host = u128::from(v6.network()) | 1;
            IpNet::V6(Ipv6Net::from(Ipv6Addr::from(host)))
        }
    }
}
