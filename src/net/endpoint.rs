//! IPv4 endpoint type with strict textual parse/format.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A dotted-quad IPv4 host plus TCP/UDP port.
///
/// The textual form is `a.b.c.d:port`; parsing is strict (canonical
/// dotted-quad, digits-only port in `0..=65535`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }

    /// `127.0.0.1:port`
    pub fn loopback(port: u16) -> Self {
        Self::new(Ipv4Addr::LOCALHOST, port)
    }

    /// `0.0.0.0:port`
    pub fn any(port: u16) -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, port)
    }

    /// Parses `a.b.c.d:port`, splitting on the last `:`.
    pub fn parse(text: &str) -> Result<Self> {
        let separator = text.rfind(':').ok_or(Error::from_raw(libc::EINVAL))?;
        if separator == 0 || separator + 1 >= text.len() {
            return Err(Error::from_raw(libc::EINVAL));
        }

        let (host_text, port_text) = (&text[..separator], &text[separator + 1..]);
        if !port_text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::from_raw(libc::EINVAL));
        }

        let mut port: u32 = 0;
        for b in port_text.bytes() {
            port = port * 10 + u32::from(b - b'0');
            if port > u32::from(u16::MAX) {
                return Err(Error::from_raw(libc::EINVAL));
            }
        }

        let addr = Ipv4Addr::from_str(host_text).map_err(|_| Error::from_raw(libc::EINVAL))?;
        Ok(Self::new(addr, port as u16))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        Self::parse(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_then_format_round_trips() {
        for text in ["127.0.0.1:0", "10.1.2.3:8080", "255.255.255.255:65535"] {
            let endpoint = Endpoint::parse(text).unwrap();
            assert_eq!(endpoint.to_string(), text);
        }
    }

    #[test]
    fn helpers_use_canonical_hosts() {
        assert_eq!(Endpoint::loopback(9000).to_string(), "127.0.0.1:9000");
        assert_eq!(Endpoint::any(80).to_string(), "0.0.0.0:80");
    }

    #[test]
    fn rejects_malformed_input() {
        for text in [
            "",
            "127.0.0.1",
            ":80",
            "127.0.0.1:",
            "127.0.0.1:abc",
            "127.0.0.1:+80",
            "127.0.0.1:65536",
            "256.0.0.1:80",
            "1.2.3:80",
            "host:80",
        ] {
            let err = Endpoint::parse(text).unwrap_err();
            assert_eq!(err.code(), libc::EINVAL, "input {text:?}");
        }
    }

    #[test]
    fn last_colon_splits() {
        // A stray extra colon lands in the host part and fails address parsing.
        let err = Endpoint::parse("1.2.3.4:5:80").unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }
}
