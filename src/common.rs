//! Address and duration helpers shared across portfwd modules.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::time::Duration;

/// Parses a listen address string into a SocketAddr.
///
/// `":port"` is shorthand for all IPv4 interfaces.
pub fn parse_listen_address(listen: &str) -> Result<SocketAddr> {
    let addr_str = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };

    addr_str
        .parse()
        .map_err(|e| Error::InvalidMapping(format!("invalid listen address '{}': {}", listen, e)))
}

/// Splits a `host:port` string, accepting bracketed IPv6 hosts.
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let Some(colon_pos) = addr.rfind(':') else {
        return Err(Error::InvalidMapping(format!(
            "address must include port: '{}'",
            addr
        )));
    };

    let host_part = &addr[..colon_pos];
    let port_part = &addr[colon_pos + 1..];

    let host = if host_part.starts_with('[') && host_part.ends_with(']') {
        &host_part[1..host_part.len() - 1]
    } else {
        host_part
    };

    if host.is_empty() {
        return Err(Error::InvalidMapping(format!(
            "address must include host: '{}'",
            addr
        )));
    }

    let port: u16 = port_part
        .parse()
        .map_err(|_| Error::InvalidMapping(format!("invalid port in address '{}'", addr)))?;

    Ok((host.to_string(), port))
}

/// Formats a duration in a human-readable format similar to Go's duration format.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let nanos = d.subsec_nanos();

    if secs == 0 && nanos == 0 {
        return "0s".to_string();
    }

    let mut result = String::new();

    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs_remainder = secs % 60;

    if hours > 0 {
        result.push_str(&format!("{}h", hours));
    }
    if mins > 0 {
        result.push_str(&format!("{}m", mins));
    }
    if secs_remainder > 0 {
        result.push_str(&format!("{}s", secs_remainder));
    } else if nanos > 0 && hours == 0 && mins == 0 {
        let ms = nanos / 1_000_000;
        if ms > 0 {
            result.push_str(&format!("{}ms", ms));
        }
    }

    if result.is_empty() {
        "0s".to_string()
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_address_with_port_only() {
        let addr = parse_listen_address(":9443").unwrap();
        assert_eq!(addr.port(), 9443);
        assert_eq!(addr.ip(), std::net::Ipv4Addr::new(0, 0, 0, 0));
    }

    #[test]
    fn test_parse_listen_address_with_full_addr() {
        let addr = parse_listen_address("127.0.0.1:9443").unwrap();
        assert_eq!(addr.port(), 9443);
        assert_eq!(addr.ip(), std::net::Ipv4Addr::new(127, 0, 0, 1));
    }

    #[test]
    fn test_parse_listen_address_ipv6() {
        let addr = parse_listen_address("[::1]:9443").unwrap();
        assert_eq!(addr.port(), 9443);
    }

    #[test]
    fn test_parse_listen_address_invalid() {
        assert!(parse_listen_address("invalid").is_err());
        assert!(parse_listen_address("localhost:80").is_err());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(split_host_port("[::1]:22").unwrap(), ("::1".to_string(), 22));
    }

    #[test]
    fn test_split_host_port_rejects_bad_input() {
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port("example.com:http").is_err());
        assert!(split_host_port("example.com:70000").is_err());
        assert!(split_host_port(":80").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(
            format_duration(Duration::from_secs(3600 + 1800 + 10)),
            "1h30m10s"
        );
    }
}
