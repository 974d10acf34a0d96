//! `host:port` endpoints

use std::fmt;

use crate::spec::SpecError;

/// A network endpoint written as `host:port`
///
/// The host may be empty (`:8080`, meaning "any interface" when binding) or a
/// bracketed IPv6 literal (`[::1]:22`). The port must be a decimal `u16`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string
    pub fn parse(input: &str) -> Result<Self, SpecError> {
        let invalid = || SpecError::InvalidEndpoint(input.to_string());

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let close = rest.find(']').ok_or_else(invalid)?;
            let host = &rest[..close];
            let port = rest[close + 1..].strip_prefix(':').ok_or_else(invalid)?;
            (host, port)
        } else {
            let colon = input.rfind(':').ok_or_else(invalid)?;
            let host = &input[..colon];
            // Unbracketed hosts cannot carry a colon of their own
            if host.contains(':') || host.contains('[') || host.contains(']') {
                return Err(invalid());
            }
            (host, &input[colon + 1..])
        };

        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address suitable for binding a local socket (empty host = all interfaces)
    pub fn local_bind_addr(&self) -> String {
        Self::join(self.host_or("0.0.0.0"), self.port)
    }

    /// Address suitable for dialing from this machine (empty host = loopback)
    pub fn local_dial_addr(&self) -> String {
        Self::join(self.host_or("127.0.0.1"), self.port)
    }

    fn host_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.host.is_empty() {
            fallback
        } else {
            &self.host
        }
    }

    fn join(host: &str, port: u16) -> String {
        if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&Self::join(&self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let ep = Endpoint::parse("127.0.0.1:8080").unwrap();
        assert_eq!(ep.host(), "127.0.0.1");
        assert_eq!(ep.port(), 8080);
        assert_eq!(ep.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_parse_hostname() {
        let ep = Endpoint::parse("db.internal:5432").unwrap();
        assert_eq!(ep.host(), "db.internal");
        assert_eq!(ep.port(), 5432);
    }

    #[test]
    fn test_parse_empty_host() {
        let ep = Endpoint::parse(":9000").unwrap();
        assert_eq!(ep.host(), "");
        assert_eq!(ep.local_bind_addr(), "0.0.0.0:9000");
        assert_eq!(ep.local_dial_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_parse_ipv6() {
        let ep = Endpoint::parse("[::1]:22").unwrap();
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.port(), 22);
        assert_eq!(ep.to_string(), "[::1]:22");
        assert_eq!(ep.local_dial_addr(), "[::1]:22");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for input in [
            "notanaddress",
            "host:",
            "host:port",
            "host:70000",
            "::1:22",
            "[::1]22",
            "[::1",
            "",
        ] {
            assert!(
                Endpoint::parse(input).is_err(),
                "expected {:?} to be rejected",
                input
            );
        }
    }
}
