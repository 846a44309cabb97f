//! Local network helpers: free ports, outbound address, locality checks.

use crate::error::{DistError, Result};
use std::net::{IpAddr, Ipv4Addr, TcpListener, UdpSocket};
use std::sync::OnceLock;

/// Find a TCP port in `start..=end` that can be bound right now.
///
/// At most `attempts` ports are probed, in ascending order.
pub fn find_free_port(start: u16, end: u16, attempts: usize) -> Result<u16> {
    if start > end {
        return Err(DistError::config(format!(
            "invalid port range {start}-{end}"
        )));
    }

    for port in (start..=end).take(attempts) {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)) {
            Ok(listener) => {
                drop(listener);
                tracing::debug!("Found free port {}", port);
                return Ok(port);
            }
            Err(e) => tracing::trace!("Port {} unavailable: {}", port, e),
        }
    }

    Err(DistError::connection(
        format!("0.0.0.0:{start}-{end}"),
        format!("no free port after {attempts} attempts"),
    ))
}

/// IPv4 address of the interface used for outbound traffic.
///
/// Connecting a UDP socket sends no packet; it only selects a route. Falls back
/// to loopback when no route exists.
pub fn default_ipv4() -> Ipv4Addr {
    static DEFAULT: OnceLock<Ipv4Addr> = OnceLock::new();
    *DEFAULT.get_or_init(|| {
        let probe = || -> std::io::Result<Ipv4Addr> {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            match socket.local_addr()?.ip() {
                IpAddr::V4(ip) => Ok(ip),
                IpAddr::V6(_) => Ok(Ipv4Addr::LOCALHOST),
            }
        };
        probe().unwrap_or(Ipv4Addr::LOCALHOST)
    })
}

/// Host part of `host`, `host:port`, `user@host` or `[v6]:port`
pub fn host_of(address: &str) -> &str {
    let address = address.rsplit_once('@').map_or(address, |(_, host)| host);

    if let Some(rest) = address.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(host, _)| host);
    }
    match address.split_once(':') {
        // A single colon separates host and port; more colons mean bare IPv6
        Some((host, port)) if !port.contains(':') => host,
        _ => address,
    }
}

/// Whether `address` designates this machine
pub fn is_local(address: &str) -> bool {
    let host = host_of(address);
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_loopback() || ip.is_unspecified() => true,
        Ok(IpAddr::V4(ip)) => ip == default_ipv4(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_port_is_bindable() {
        let port = find_free_port(47100, 47200, 50).unwrap();
        assert!((47100..=47200).contains(&port));
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).unwrap();
    }

    #[test]
    fn test_occupied_port_is_skipped() {
        let held = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let taken = held.local_addr().unwrap().port();

        let result = find_free_port(taken, taken, 1);
        assert!(matches!(result, Err(DistError::Connection { .. })));
    }

    #[test]
    fn test_invalid_range() {
        assert!(matches!(
            find_free_port(9000, 8000, 5),
            Err(DistError::Configuration(_))
        ));
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("10.0.0.1"), "10.0.0.1");
        assert_eq!(host_of("10.0.0.1:8786"), "10.0.0.1");
        assert_eq!(host_of("agi@10.0.0.1"), "10.0.0.1");
        assert_eq!(host_of("[::1]:8786"), "::1");
        assert_eq!(host_of("::1"), "::1");
    }

    #[test]
    fn test_is_local() {
        assert!(is_local("127.0.0.1"));
        assert!(is_local("localhost:8786"));
        assert!(is_local("[::1]:22"));
        assert!(is_local(&default_ipv4().to_string()));
        assert!(!is_local("203.0.113.7"));
        assert!(!is_local("build-node.example.com"));
    }
}
