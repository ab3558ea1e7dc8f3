// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Address space arithmetic for the gateway subnet.
//!
//! Everything here is pure. A [`Subnet`] is always a normalized private IPv4
//! block with a prefix between /16 and /30; the first host address is the
//! gateway (and the server's own address), peers start one above it.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::Ipv4Network;

pub const MIN_PREFIX: u8 = 16;
pub const MAX_PREFIX: u8 = 30;

/// Placeholder written by some tools for peers with no real route.
pub const NO_ROUTE: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

pub const DEFAULT_SUBNET: &str = "10.100.0.0/24";

/// Prefix assumed when a configured subnet is missing its length.
pub const FALLBACK_PREFIX: u8 = 24;

const RFC1918: &[&str] = &["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("{0} is not a private address range")]
    NotPrivate(String),

    #[error("prefix /{0} out of range (must be /{MIN_PREFIX} to /{MAX_PREFIX})")]
    PrefixOutOfRange(u8),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

// ---------------------------------------------------------------------------
// CIDR math helpers
// ---------------------------------------------------------------------------

fn ip_to_u32(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}

fn u32_to_ip(n: u32) -> Ipv4Addr {
    Ipv4Addr::from(n)
}

fn network_contains(net: Ipv4Network, other: Ipv4Network) -> bool {
    net.prefix() <= other.prefix() && net.contains(other.ip())
}

fn rfc1918_networks() -> impl Iterator<Item = Ipv4Network> {
    RFC1918.iter().filter_map(|s| s.parse().ok())
}

pub fn is_private(net: Ipv4Network) -> bool {
    rfc1918_networks().any(|private| network_contains(private, net))
}

/// Parse `a.b.c.d/len` or a bare `a.b.c.d` (taken as `/32`).
///
/// Only the first entry of a comma-separated list is considered, which is
/// how `AllowedIPs` and `Address` lines carry a peer's own address.
pub fn parse_host(s: &str) -> Option<(Ipv4Addr, u8)> {
    let first = s.split(',').next()?.trim();
    match first.split_once('/') {
        Some((addr, prefix)) => {
            let addr = addr.trim().parse().ok()?;
            let prefix: u8 = prefix.trim().parse().ok()?;
            (prefix <= 32).then_some((addr, prefix))
        }
        None => first.parse().ok().map(|addr| (addr, 32)),
    }
}

/// The gateway-side routing form of a peer address.
pub fn server_view(host: Ipv4Addr) -> String {
    format!("{host}/32")
}

/// True when the stored value is the routed `/32` form.
pub fn is_server_view(s: &str) -> bool {
    matches!(parse_host(s), Some((_, 32)))
}

// ---------------------------------------------------------------------------
// Subnet
// ---------------------------------------------------------------------------

/// Derived boundaries of a [`Subnet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ranges {
    pub gateway: Ipv4Addr,
    pub first_peer: Ipv4Addr,
    pub last_usable: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet(Ipv4Network);

impl Subnet {
    /// Parse and validate a CIDR, normalizing host bits away.
    pub fn parse(cidr: &str) -> Result<Self, AddressError> {
        if !cidr.contains('/') {
            return Err(AddressError::InvalidCidr(cidr.to_string()));
        }
        let raw: Ipv4Network = cidr
            .trim()
            .parse()
            .map_err(|_| AddressError::InvalidCidr(cidr.to_string()))?;
        Self::from_parts(raw.ip(), raw.prefix())
    }

    /// Build the subnet that contains `ip` at the given prefix length.
    pub fn from_parts(ip: Ipv4Addr, prefix: u8) -> Result<Self, AddressError> {
        if !(MIN_PREFIX..=MAX_PREFIX).contains(&prefix) {
            return Err(AddressError::PrefixOutOfRange(prefix));
        }
        let net = Ipv4Network::new(ip, prefix)
            .map_err(|_| AddressError::InvalidCidr(format!("{ip}/{prefix}")))?;
        let net = Ipv4Network::new(net.network(), prefix)
            .map_err(|_| AddressError::InvalidCidr(format!("{ip}/{prefix}")))?;
        if !is_private(net) {
            return Err(AddressError::NotPrivate(net.to_string()));
        }
        Ok(Self(net))
    }

    /// Resolve the configured subnet, tolerating a missing prefix length.
    ///
    /// A value without `/len` gets [`FALLBACK_PREFIX`]; anything else that
    /// fails validation is an error for the caller to handle.
    pub fn from_configured(value: &str) -> Result<Self, AddressError> {
        if value.contains('/') {
            Self::parse(value)
        } else {
            Self::parse(&format!("{}/{FALLBACK_PREFIX}", value.trim()))
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.0.network()
    }

    pub fn prefix(&self) -> u8 {
        self.0.prefix()
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.0.broadcast()
    }

    /// Host-addressable count: network and broadcast excluded, gateway included.
    pub fn capacity(&self) -> u32 {
        (1u32 << (32 - self.prefix())) - 2
    }

    pub fn ranges(&self) -> Ranges {
        let network = ip_to_u32(self.network());
        let broadcast = ip_to_u32(self.broadcast());
        Ranges {
            gateway: u32_to_ip(network + 1),
            first_peer: u32_to_ip(network + 2),
            last_usable: u32_to_ip(broadcast - 1),
        }
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.ranges().gateway
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.0.contains(addr)
    }

    /// Network, broadcast and gateway can never be handed to a peer.
    pub fn is_reserved(&self, addr: Ipv4Addr) -> bool {
        addr == self.network() || addr == self.broadcast() || addr == self.gateway()
    }

    /// Peer-assignable addresses in ascending order.
    pub fn peer_hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let Ranges {
            first_peer,
            last_usable,
            ..
        } = self.ranges();
        (ip_to_u32(first_peer)..=ip_to_u32(last_usable)).map(u32_to_ip)
    }

    /// The client-side form of a peer address: host with the subnet prefix.
    pub fn client_view(&self, host: Ipv4Addr) -> String {
        format!("{host}/{}", self.prefix())
    }

    /// Interpret a caller-supplied address.
    ///
    /// Accepts a dotted address (optionally with a `/len` suffix, which is
    /// ignored) or a bare last-octet integer applied to the subnet's base.
    pub fn resolve_candidate(&self, requested: &str) -> Result<Ipv4Addr, AddressError> {
        let requested = requested.trim();
        if let Ok(octet) = requested.parse::<u8>() {
            let base = ip_to_u32(self.network()) & 0xffff_ff00;
            return Ok(u32_to_ip(base | u32::from(octet)));
        }
        parse_host(requested)
            .map(|(addr, _)| addr)
            .ok_or_else(|| AddressError::InvalidAddress(requested.to_string()))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix())
    }
}

impl FromStr for Subnet {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

pub fn capacity(cidr: &str) -> Result<u32, AddressError> {
    Subnet::parse(cidr).map(|s| s.capacity())
}

pub fn ranges(cidr: &str) -> Result<Ranges, AddressError> {
    Subnet::parse(cidr).map(|s| s.ranges())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test_case("10.100.0.0/24", 254 ; "slash 24")]
    #[test_case("10.100.0.0/30", 2 ; "slash 30")]
    #[test_case("172.16.0.0/16", 65534 ; "slash 16")]
    #[test_case("192.168.10.0/28", 14 ; "slash 28")]
    fn capacity_excludes_network_and_broadcast(cidr: &str, expected: u32) {
        assert_eq!(capacity(cidr).unwrap(), expected);
    }

    #[test]
    fn capacity_formula_holds_for_every_prefix() {
        for prefix in MIN_PREFIX..=MAX_PREFIX {
            let subnet = Subnet::parse(&format!("10.0.0.0/{prefix}")).unwrap();
            assert_eq!(subnet.capacity(), (1u32 << (32 - prefix)) - 2);
        }
    }

    #[test]
    fn ranges_for_slash_24() {
        let r = ranges("10.100.0.0/24").unwrap();
        assert_eq!(r.gateway, ip("10.100.0.1"));
        assert_eq!(r.first_peer, ip("10.100.0.2"));
        assert_eq!(r.last_usable, ip("10.100.0.254"));
    }

    #[test_case("10.100.0.0/15", AddressError::PrefixOutOfRange(15) ; "too wide")]
    #[test_case("10.100.0.0/31", AddressError::PrefixOutOfRange(31) ; "too narrow")]
    #[test_case("8.8.8.0/24", AddressError::NotPrivate("8.8.8.0/24".into()) ; "public range")]
    #[test_case("10.100.0.0", AddressError::InvalidCidr("10.100.0.0".into()) ; "missing prefix")]
    #[test_case("nonsense", AddressError::InvalidCidr("nonsense".into()) ; "garbage")]
    fn invalid_subnets_rejected(cidr: &str, expected: AddressError) {
        assert_eq!(Subnet::parse(cidr).unwrap_err(), expected);
    }

    #[test]
    fn parse_normalizes_host_bits() {
        let subnet = Subnet::parse("10.100.0.1/24").unwrap();
        assert_eq!(subnet.to_string(), "10.100.0.0/24");
    }

    #[test]
    fn configured_value_without_prefix_defaults_to_24() {
        let subnet = Subnet::from_configured("10.8.0.0").unwrap();
        assert_eq!(subnet.to_string(), "10.8.0.0/24");
    }

    #[test_case("10.100.0.5/24", Some(("10.100.0.5", 24)) ; "client view")]
    #[test_case("10.100.0.5/32, 192.168.1.0/24", Some(("10.100.0.5", 32)) ; "list takes first")]
    #[test_case("10.100.0.5", Some(("10.100.0.5", 32)) ; "bare address")]
    #[test_case("10.100.0.5/40", None ; "bad prefix")]
    #[test_case("", None ; "empty")]
    fn parse_host_forms(input: &str, expected: Option<(&str, u8)>) {
        assert_eq!(parse_host(input), expected.map(|(a, p)| (ip(a), p)));
    }

    #[test_case("5", "10.100.0.5" ; "last octet")]
    #[test_case("10.100.0.9", "10.100.0.9" ; "dotted")]
    #[test_case("10.100.0.9/24", "10.100.0.9" ; "dotted with prefix")]
    fn resolve_candidate_forms(input: &str, expected: &str) {
        let subnet = Subnet::parse("10.100.0.0/24").unwrap();
        assert_eq!(subnet.resolve_candidate(input).unwrap(), ip(expected));
    }

    #[test]
    fn views_differ_only_in_prefix() {
        let subnet = Subnet::parse("10.100.0.0/24").unwrap();
        let host = ip("10.100.0.5");
        assert_eq!(subnet.client_view(host), "10.100.0.5/24");
        assert_eq!(server_view(host), "10.100.0.5/32");
        assert!(is_server_view(&server_view(host)));
        assert!(!is_server_view(&subnet.client_view(host)));
    }

    #[test]
    fn reserved_addresses() {
        let subnet = Subnet::parse("10.100.0.0/24").unwrap();
        assert!(subnet.is_reserved(ip("10.100.0.0")));
        assert!(subnet.is_reserved(ip("10.100.0.1")));
        assert!(subnet.is_reserved(ip("10.100.0.255")));
        assert!(!subnet.is_reserved(ip("10.100.0.2")));
    }
}
