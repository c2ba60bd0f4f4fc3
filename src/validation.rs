//! Centralized validation functions for Warden.
//!
//! This module provides unified validation for:
//! - IP addresses and CIDR ranges (ignore lists)
//! - Address classification of captured log text
//! - Node names used in the shared ban store

use anyhow::{bail, Result};
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Longest hostname accepted for resolution (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// Validate an IP address string and return the parsed IpAddr.
///
/// # Examples
/// ```
/// use warden::validation::validate_ip;
/// assert!(validate_ip("192.168.1.1").is_ok());
/// assert!(validate_ip("::1").is_ok());
/// assert!(validate_ip("invalid").is_err());
/// ```
pub fn validate_ip(ip_str: &str) -> Result<IpAddr> {
    ip_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid IP address: {}", ip_str))
}

/// Validate an IP address or CIDR string and return the parsed IpNet.
///
/// If the input is a plain IP address (without /prefix), it will be converted
/// to a /32 (IPv4) or /128 (IPv6) network.
///
/// # Examples
/// ```
/// use warden::validation::validate_ip_or_cidr;
/// assert!(validate_ip_or_cidr("192.168.1.1").is_ok());
/// assert!(validate_ip_or_cidr("192.168.0.0/24").is_ok());
/// assert!(validate_ip_or_cidr("invalid").is_err());
/// ```
pub fn validate_ip_or_cidr(ip_str: &str) -> Result<IpNet> {
    if ip_str.contains('/') {
        ip_str
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid CIDR: {}", ip_str))
    } else {
        let ip: IpAddr = ip_str
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid IP address: {}", ip_str))?;
        Ok(IpNet::from(ip))
    }
}

/// Classify captured address text as a literal address.
///
/// IPv4 syntax is tried first, then IPv6 (optionally bracketed).
/// `None` means the text is not a literal address and should be treated
/// as a hostname.
///
/// # Examples
/// ```
/// use warden::validation::classify_address;
/// assert!(classify_address("203.0.113.7").unwrap().is_ipv4());
/// assert!(classify_address("[2001:db8::1]").unwrap().is_ipv6());
/// assert!(classify_address("scanner.example.net").is_none());
/// ```
pub fn classify_address(text: &str) -> Option<IpAddr> {
    let text = text.trim();
    if let Ok(v4) = text.parse::<Ipv4Addr>() {
        return Some(IpAddr::V4(v4));
    }
    let unbracketed = text
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .unwrap_or(text);
    if let Ok(v6) = unbracketed.parse::<Ipv6Addr>() {
        return Some(IpAddr::V6(v6));
    }
    None
}

/// Whether text could be a DNS hostname worth resolving.
pub fn is_plausible_hostname(text: &str) -> bool {
    !text.is_empty()
        && text.len() <= MAX_HOSTNAME_LEN
        && text
            .split('.')
            .all(|label| !label.is_empty() && label.len() <= 63)
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Validate a node name for the shared store.
///
/// Node names become hash fields and appear in broadcast payloads
/// (`"<address> <node>"`), so they must be non-empty and free of whitespace.
/// The shared field names `reason`, `origin_node` and `country` are reserved.
pub fn validate_node_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("Networked storage requires a node name");
    }
    if name.chars().any(char::is_whitespace) {
        bail!("Invalid node name '{}': contains whitespace", name);
    }
    if matches!(name, "reason" | "origin_node" | "country") {
        bail!("Invalid node name '{}': reserved field name", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_ip_v4_valid() {
        let result = validate_ip("192.168.1.1");
        assert!(result.is_ok());
        assert!(result.unwrap().is_ipv4());
    }

    #[test]
    fn test_validate_ip_v6_valid() {
        let result = validate_ip("::1");
        assert!(result.is_ok());
        assert!(result.unwrap().is_ipv6());
    }

    #[test]
    fn test_validate_ip_invalid() {
        let result = validate_ip("not-an-ip");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid IP"));
    }

    #[test]
    fn test_validate_ip_or_cidr_v4() {
        let result = validate_ip_or_cidr("10.0.0.0/8");
        assert!(result.is_ok());
        assert_eq!(result.unwrap().prefix_len(), 8);
    }

    #[test]
    fn test_validate_ip_or_cidr_plain_ip_becomes_host() {
        let net = validate_ip_or_cidr("203.0.113.9").unwrap();
        assert_eq!(net.prefix_len(), 32);
        let net = validate_ip_or_cidr("2001:db8::1").unwrap();
        assert_eq!(net.prefix_len(), 128);
    }

    #[test]
    fn test_validate_ip_or_cidr_invalid() {
        assert!(validate_ip_or_cidr("10.0.0.0/33").is_err());
        assert!(validate_ip_or_cidr("").is_err());
    }

    #[test]
    fn test_classify_v4_before_v6() {
        assert_eq!(
            classify_address("198.51.100.4"),
            Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4)))
        );
    }

    #[test]
    fn test_classify_v6() {
        assert_eq!(classify_address("::1"), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(classify_address("[::1]"), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn test_classify_hostname_and_garbage() {
        assert_eq!(classify_address("host.example.com"), None);
        assert_eq!(classify_address("256.1.1.1"), None);
        assert_eq!(classify_address(""), None);
    }

    #[test]
    fn test_plausible_hostname() {
        assert!(is_plausible_hostname("scanner.example.net"));
        assert!(is_plausible_hostname("localhost"));
        assert!(!is_plausible_hostname(""));
        assert!(!is_plausible_hostname("bad host"));
        assert!(!is_plausible_hostname("a..b"));
        assert!(!is_plausible_hostname(&"a".repeat(300)));
    }

    #[test]
    fn test_validate_node_name() {
        assert!(validate_node_name("web-1").is_ok());
        assert!(validate_node_name("").is_err());
        assert!(validate_node_name("web 1").is_err());
        assert!(validate_node_name("reason").is_err());
    }
}
