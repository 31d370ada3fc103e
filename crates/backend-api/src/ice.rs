//! `stun:` / `turn:` URI grammar used by the call configuration.
//!
//! The accepted forms are `stun:host:port`, `turn:host:port` and
//! `turns:host:port`, optionally followed by `?transport=udp|tcp`.
//! `turns:` implies TLS transport.

use std::fmt;
use std::str::FromStr;

/// Default port when the URI omits one.
pub const DEFAULT_PORT: u16 = 3478;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum IceUriError {
    #[error("empty ice uri")]
    Empty,
    #[error("unknown ice uri scheme '{0}'")]
    UnknownScheme(String),
    #[error("missing host in ice uri")]
    MissingHost,
    #[error("invalid port '{0}'")]
    InvalidPort(String),
    #[error("invalid transport '{0}'")]
    InvalidTransport(String),
}

/// ICE server kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceScheme {
    Stun,
    Turn,
}

impl IceScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            IceScheme::Stun => "stun",
            IceScheme::Turn => "turn",
        }
    }
}

/// Transport to the ICE server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceTransport {
    Udp,
    Tcp,
    Tls,
}

impl IceTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            IceTransport::Udp => "udp",
            IceTransport::Tcp => "tcp",
            IceTransport::Tls => "tls",
        }
    }
}

/// A decoded `stun:`/`turn:` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceUri {
    pub scheme: IceScheme,
    pub transport: IceTransport,
    pub host: String,
    pub port: u16,
}

impl FromStr for IceUri {
    type Err = IceUriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IceUriError::Empty);
        }

        let (scheme_str, rest) = s
            .split_once(':')
            .ok_or_else(|| IceUriError::UnknownScheme(s.to_string()))?;
        let (scheme, secure) = match scheme_str {
            "stun" => (IceScheme::Stun, false),
            "turn" => (IceScheme::Turn, false),
            "turns" => (IceScheme::Turn, true),
            other => return Err(IceUriError::UnknownScheme(other.to_string())),
        };

        let (addr, query) = match rest.split_once('?') {
            Some((addr, query)) => (addr, Some(query)),
            None => (rest, None),
        };

        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| IceUriError::InvalidPort(port.to_string()))?;
                (host, port)
            }
            None => (addr, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(IceUriError::MissingHost);
        }

        let mut transport = if secure {
            IceTransport::Tls
        } else {
            IceTransport::Udp
        };
        if let Some(query) = query {
            for param in query.split('&') {
                if let Some(("transport", value)) = param.split_once('=') {
                    transport = match value {
                        "udp" if secure => IceTransport::Tls,
                        "udp" => IceTransport::Udp,
                        "tcp" if secure => IceTransport::Tls,
                        "tcp" => IceTransport::Tcp,
                        other => return Err(IceUriError::InvalidTransport(other.to_string())),
                    };
                }
            }
        }

        Ok(IceUri {
            scheme,
            transport,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for IceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.scheme.as_str(), self.host, self.port)?;
        if self.transport != IceTransport::Udp {
            write!(f, "?transport={}", self.transport.as_str())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_stun() {
        let uri: IceUri = "stun:stun.example.com:3478".parse().unwrap();
        assert_eq!(uri.scheme, IceScheme::Stun);
        assert_eq!(uri.transport, IceTransport::Udp);
        assert_eq!(uri.host, "stun.example.com");
        assert_eq!(uri.port, 3478);
    }

    #[test]
    fn parses_turn_tcp() {
        let uri: IceUri = "turn:turn.example.com:3478?transport=tcp".parse().unwrap();
        assert_eq!(uri.scheme, IceScheme::Turn);
        assert_eq!(uri.transport, IceTransport::Tcp);
    }

    #[test]
    fn turns_implies_tls() {
        let uri: IceUri = "turns:turn.example.com:5349".parse().unwrap();
        assert_eq!(uri.scheme, IceScheme::Turn);
        assert_eq!(uri.transport, IceTransport::Tls);
        assert_eq!(uri.port, 5349);
    }

    #[test]
    fn missing_port_defaults() {
        let uri: IceUri = "stun:stun.example.com".parse().unwrap();
        assert_eq!(uri.port, DEFAULT_PORT);
    }

    #[test]
    fn rejects_unknown_scheme() {
        let err = "http://example.com".parse::<IceUri>().unwrap_err();
        assert!(matches!(err, IceUriError::UnknownScheme(_)));
    }

    #[test]
    fn rejects_bad_port() {
        let err = "turn:host:notaport".parse::<IceUri>().unwrap_err();
        assert!(matches!(err, IceUriError::InvalidPort(_)));
    }
}
