// SPDX-License-Identifier: MIT OR Apache-2.0
//! Domain allowlist normalization and non-global IP classification (§4.5).
//!
//! Written as a small bespoke matcher rather than reusing `rumi-glob`:
//! `rumi-glob` matches filesystem-style glob patterns, not the domain
//! wildcard/suffix-implication rule this policy needs (granting `x.y`
//! implies `*.x.y`), so the semantics would not line up cleanly.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Lower-case `host`/pattern and strip a single trailing dot. No punycode
/// normalization is performed (DECIDED — see DESIGN.md): IDN domains must
/// already be punycoded by the grant author.
pub fn normalize_host(host: &str) -> String {
    let trimmed = host.trim();
    let without_dot = trimmed.strip_suffix('.').unwrap_or(trimmed);
    without_dot.to_ascii_lowercase()
}

/// `true` if `host` matches any entry in `allowed_domains`.
///
/// Both an exact pattern (`api.example.com`) and a wildcard pattern
/// (`*.example.com`) admit the same set: the bare pattern itself, and any of
/// its subdomains. Granting `example.com` therefore implies `*.example.com`,
/// per the decided normalization rule.
pub fn domain_allowed(allowed_domains: &[String], host: &str) -> bool {
    let host_n = normalize_host(host);
    allowed_domains.iter().any(|pattern| {
        let pattern_n = normalize_host(pattern);
        let bare = pattern_n.strip_prefix("*.").unwrap_or(&pattern_n);
        host_n == bare || host_n.ends_with(&format!(".{bare}"))
    })
}

/// Reason an IP address is not eligible for outbound egress, or `None` if
/// it is a global-routable unicast address.
pub fn non_global_reason(ip: IpAddr) -> Option<&'static str> {
    match ip {
        IpAddr::V4(v4) => classify_ipv4(v4),
        IpAddr::V6(v6) => classify_ipv6(v6),
    }
}

fn classify_ipv4(ip: Ipv4Addr) -> Option<&'static str> {
    if ip.is_loopback() {
        return Some("loopback");
    }
    if ip.is_private() {
        return Some("rfc1918_private");
    }
    if ip.is_link_local() {
        return Some("link_local");
    }
    if ip.is_multicast() {
        return Some("multicast");
    }
    if ip.is_unspecified() {
        return Some("unspecified");
    }
    if ip.is_broadcast() {
        return Some("broadcast");
    }
    // 100.64.0.0/10 (RFC 6598, carrier-grade NAT)
    let o = ip.octets();
    if o[0] == 100 && (o[1] & 0b1100_0000) == 0b0100_0000 {
        return Some("cgnat");
    }
    None
}

fn classify_ipv6(ip: Ipv6Addr) -> Option<&'static str> {
    if ip.is_loopback() {
        return Some("loopback");
    }
    if ip.is_multicast() {
        return Some("multicast");
    }
    if ip.is_unspecified() {
        return Some("unspecified");
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return classify_ipv4(v4);
    }
    let seg0 = ip.segments()[0];
    if (seg0 & 0xfe00) == 0xfc00 {
        return Some("unique_local"); // fc00::/7
    }
    if (seg0 & 0xffc0) == 0xfe80 {
        return Some("link_local"); // fe80::/10
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_lowercases_and_strips_trailing_dot() {
        assert_eq!(normalize_host("API.Example.com."), "api.example.com");
        assert_eq!(normalize_host("api.example.com"), "api.example.com");
    }

    #[test]
    fn exact_pattern_matches_host_and_subdomains() {
        let allowed = vec!["api.example.com".to_string()];
        assert!(domain_allowed(&allowed, "api.example.com"));
        assert!(domain_allowed(&allowed, "v2.api.example.com"));
        assert!(!domain_allowed(&allowed, "example.com"));
        assert!(!domain_allowed(&allowed, "evil.com"));
    }

    #[test]
    fn wildcard_pattern_also_matches_bare_domain() {
        let allowed = vec!["*.example.com".to_string()];
        assert!(domain_allowed(&allowed, "example.com"));
        assert!(domain_allowed(&allowed, "a.example.com"));
        assert!(!domain_allowed(&allowed, "notexample.com"));
    }

    #[test]
    fn matching_is_case_insensitive_and_ignores_trailing_dot() {
        let allowed = vec!["Example.com".to_string()];
        assert!(domain_allowed(&allowed, "EXAMPLE.COM."));
    }

    #[test]
    fn loopback_and_private_ipv4_are_rejected() {
        assert_eq!(non_global_reason("127.0.0.1".parse().unwrap()), Some("loopback"));
        assert_eq!(non_global_reason("10.0.0.1".parse().unwrap()), Some("rfc1918_private"));
        assert_eq!(non_global_reason("192.168.1.1".parse().unwrap()), Some("rfc1918_private"));
        assert_eq!(non_global_reason("169.254.1.1".parse().unwrap()), Some("link_local"));
        assert_eq!(non_global_reason("100.64.0.5".parse().unwrap()), Some("cgnat"));
        assert_eq!(non_global_reason("224.0.0.1".parse().unwrap()), Some("multicast"));
    }

    #[test]
    fn global_ipv4_is_allowed() {
        assert_eq!(non_global_reason("93.184.216.34".parse().unwrap()), None);
    }

    #[test]
    fn ipv6_loopback_and_unique_local_are_rejected() {
        assert_eq!(non_global_reason("::1".parse().unwrap()), Some("loopback"));
        assert_eq!(non_global_reason("fc00::1".parse().unwrap()), Some("unique_local"));
        assert_eq!(non_global_reason("fe80::1".parse().unwrap()), Some("link_local"));
    }

    #[test]
    fn ipv4_mapped_ipv6_inherits_ipv4_classification() {
        let mapped: IpAddr = "::ffff:127.0.0.1".parse().unwrap();
        assert_eq!(non_global_reason(mapped), Some("loopback"));
    }

    #[test]
    fn global_ipv6_is_allowed() {
        assert_eq!(non_global_reason("2606:2800:220:1:248:1893:25c8:1946".parse().unwrap()), None);
    }
}
