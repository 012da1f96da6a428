//! SSRF guard for UDP relay destinations: a fail-closed policy that refuses
//! to dial loopback, RFC1918-private, or multicast addresses.

use std::net::IpAddr;

/// Returns `true` if `ip` is allowed as a UDP relay upstream.
///
/// Only loopback, private (IPv4 RFC1918), and multicast are checked, matching
/// the literal destination policy; IPv6 unique-local and link-local ranges
/// are intentionally left unblocked (see DESIGN.md).
pub fn is_allowed(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !(v4.is_loopback() || v4.is_private() || v4.is_multicast()),
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_multicast()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_loopback_private_and_multicast() {
        assert!(!is_allowed("127.0.0.1".parse().unwrap()));
        assert!(!is_allowed("10.1.2.3".parse().unwrap()));
        assert!(!is_allowed("172.16.0.5".parse().unwrap()));
        assert!(!is_allowed("192.168.1.1".parse().unwrap()));
        assert!(!is_allowed("224.0.0.1".parse().unwrap()));
        assert!(!is_allowed("::1".parse().unwrap()));
    }

    #[test]
    fn allows_public_addresses() {
        assert!(is_allowed("8.8.8.8".parse().unwrap()));
        assert!(is_allowed("1.1.1.1".parse().unwrap()));
    }
}
