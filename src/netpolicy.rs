//! Network policy — CIDR parsing and membership tests for `allow_nets`.

use std::net::IpAddr;

/// Outcome of matching one network token against an address.
///
/// `Invalid` is distinct from `NoMatch` so callers can log a broken
/// token once and keep scanning the rest of the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetMatch {
    Match,
    NoMatch,
    Invalid,
}

/// Test whether `ip` belongs to `network` (`CIDR`, bare IPv4 or IPv6).
///
/// A bare address means the full address must match. Mixed address
/// families never match. Prefix lengths beyond the family maximum are
/// clamped.
pub fn is_ip_in_network(network: &str, ip: &IpAddr) -> NetMatch {
    let (addr_part, bits) = match network.split_once('/') {
        Some((a, b)) => match b.parse::<u32>() {
            Ok(bits) => (a, Some(bits)),
            Err(_) => return NetMatch::Invalid,
        },
        None => (network, None),
    };

    let net_ip: IpAddr = match addr_part.trim().parse() {
        Ok(ip) => ip,
        Err(_) => return NetMatch::Invalid,
    };

    let (ip_bytes, net_bytes): (Vec<u8>, Vec<u8>) = match (ip, &net_ip) {
        (IpAddr::V4(a), IpAddr::V4(n)) => (a.octets().to_vec(), n.octets().to_vec()),
        (IpAddr::V6(a), IpAddr::V6(n)) => (a.octets().to_vec(), n.octets().to_vec()),
        _ => return NetMatch::NoMatch,
    };

    let max_bits = ip_bytes.len() as u32 * 8;
    let bits = bits.unwrap_or(max_bits).min(max_bits);

    // whole bytes first, then the residual bits MSB-first
    let full = (bits / 8) as usize;
    if ip_bytes[..full] != net_bytes[..full] {
        return NetMatch::NoMatch;
    }
    let rest = bits % 8;
    if rest > 0 {
        let mask = 0xffu8 << (8 - rest);
        if ip_bytes[full] & mask != net_bytes[full] & mask {
            return NetMatch::NoMatch;
        }
    }
    NetMatch::Match
}

/// Split an `allow_nets` value into its network tokens.
pub fn split_networks(networks: &str) -> impl Iterator<Item = &str> {
    networks
        .split([',', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
