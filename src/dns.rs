//! Hostname resolution for addresses captured as names.

use std::net::IpAddr;

#[cfg(test)]
use mockall::automock;

use crate::error::WardenError;
use crate::validation::is_plausible_hostname;

/// Resolves a hostname captured from a log line to an address.
///
/// Some services log the reverse-resolved name of a peer instead of its
/// address; those names are resolved forward before tracking.
#[cfg_attr(test, automock)]
pub trait HostResolver: Send + Sync {
    fn resolve(&self, host: &str) -> Result<IpAddr, WardenError>;
}

/// Resolver backed by the system's getaddrinfo.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str) -> Result<IpAddr, WardenError> {
        if !is_plausible_hostname(host) {
            return Err(WardenError::Resolve(host.to_string()));
        }

        let addrs =
            dns_lookup::lookup_host(host).map_err(|_| WardenError::Resolve(host.to_string()))?;

        // IPv4 first, matching what a single-address lookup would return
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| WardenError::Resolve(host.to_string()))
    }
}
