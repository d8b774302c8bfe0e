//! Endpoint URIs: `<proto>://<host>:<port>`.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use wavecast_core::fec::FecScheme;
use wavecast_core::pipeline::Interface;

use crate::Error;

/// Endpoint protocol, determining the interface and FEC scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    /// Bare RTP source stream.
    Rtp,
    /// RTP source stream of a Reed-Solomon protected slot.
    RtpRs8m,
    /// Reed-Solomon repair stream.
    Rs8m,
    /// RTP source stream of an LDPC protected slot.
    RtpLdpc,
    /// LDPC repair stream.
    Ldpc,
    /// RTCP control stream.
    Rtcp,
}

impl Proto {
    /// The slot interface this protocol binds.
    pub fn interface(self) -> Interface {
        match self {
            Proto::Rtp | Proto::RtpRs8m | Proto::RtpLdpc => Interface::AudioSource,
            Proto::Rs8m | Proto::Ldpc => Interface::AudioRepair,
            Proto::Rtcp => Interface::AudioControl,
        }
    }

    /// FEC scheme implied by the protocol, if any.
    pub fn fec_scheme(self) -> Option<FecScheme> {
        match self {
            Proto::RtpRs8m | Proto::Rs8m => Some(FecScheme::Rs8m),
            Proto::RtpLdpc | Proto::Ldpc => Some(FecScheme::LdpcStaircase),
            Proto::Rtp | Proto::Rtcp => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Proto::Rtp => "rtp",
            Proto::RtpRs8m => "rtp+rs8m",
            Proto::Rs8m => "rs8m",
            Proto::RtpLdpc => "rtp+ldpc",
            Proto::Ldpc => "ldpc",
            Proto::Rtcp => "rtcp",
        }
    }
}

impl FromStr for Proto {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "rtp" => Ok(Proto::Rtp),
            "rtp+rs8m" => Ok(Proto::RtpRs8m),
            "rs8m" => Ok(Proto::Rs8m),
            "rtp+ldpc" => Ok(Proto::RtpLdpc),
            "ldpc" => Ok(Proto::Ldpc),
            "rtcp" => Ok(Proto::Rtcp),
            other => Err(Error::BadUri(format!("unknown protocol '{}'", other))),
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed endpoint URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUri {
    /// Protocol.
    pub proto: Proto,
    /// Host name or literal address.
    pub host: String,
    /// UDP port.
    pub port: u16,
}

impl EndpointUri {
    /// Builds a URI from parts.
    pub fn new(proto: Proto, host: &str, port: u16) -> Self {
        EndpointUri {
            proto,
            host: host.to_string(),
            port,
        }
    }

    /// Resolves the host and port into a socket address.
    pub fn resolve(&self) -> Result<SocketAddr, Error> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::BadUri(format!("'{}' did not resolve", self)))
    }
}

impl FromStr for EndpointUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (proto, rest) = s
            .split_once("://")
            .ok_or_else(|| Error::BadUri(format!("missing '://' in '{}'", s)))?;
        let proto: Proto = proto.parse()?;

        // Bracketed IPv6 literal or plain host:port.
        let (host, port) = if let Some(rest) = rest.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| Error::BadUri(format!("unterminated '[' in '{}'", s)))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| Error::BadUri(format!("missing port in '{}'", s)))?;
            (host.to_string(), port)
        } else {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| Error::BadUri(format!("missing port in '{}'", s)))?;
            (host.to_string(), port)
        };

        if host.is_empty() {
            return Err(Error::BadUri(format!("empty host in '{}'", s)));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| Error::BadUri(format!("bad port in '{}'", s)))?;
        Ok(EndpointUri { proto, host, port })
    }
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.proto, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.proto, self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let uri: EndpointUri = "rtp+rs8m://127.0.0.1:10001".parse().unwrap();
        assert_eq!(uri.proto, Proto::RtpRs8m);
        assert_eq!(uri.host, "127.0.0.1");
        assert_eq!(uri.port, 10001);
        assert_eq!(uri.to_string(), "rtp+rs8m://127.0.0.1:10001");
    }

    #[test]
    fn test_parse_ipv6() {
        let uri: EndpointUri = "rtcp://[::1]:9003".parse().unwrap();
        assert_eq!(uri.host, "::1");
        assert_eq!(uri.port, 9003);
        assert_eq!(uri.to_string(), "rtcp://[::1]:9003");
    }

    #[test]
    fn test_proto_mapping() {
        assert_eq!(Proto::Rtp.interface(), Interface::AudioSource);
        assert_eq!(Proto::Rs8m.interface(), Interface::AudioRepair);
        assert_eq!(Proto::Rtcp.interface(), Interface::AudioControl);
        assert_eq!(Proto::RtpRs8m.fec_scheme(), Some(FecScheme::Rs8m));
        assert_eq!(Proto::Ldpc.fec_scheme(), Some(FecScheme::LdpcStaircase));
        assert_eq!(Proto::Rtp.fec_scheme(), None);
    }

    #[test]
    fn test_bad_uris_are_rejected() {
        for bad in [
            "rtp//127.0.0.1:1",
            "bogus://127.0.0.1:1",
            "rtp://127.0.0.1",
            "rtp://:10",
            "rtp://127.0.0.1:notaport",
            "rtcp://[::1:9",
        ] {
            assert!(bad.parse::<EndpointUri>().is_err(), "{} parsed", bad);
        }
    }

    #[test]
    fn test_resolve_loopback() {
        let uri: EndpointUri = "rtp://127.0.0.1:5000".parse().unwrap();
        let addr = uri.resolve().unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 5000);
    }
}
