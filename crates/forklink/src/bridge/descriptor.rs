//! Session token and connection descriptor handed to the forked worker.
//!
//! Descriptor format: `tcp://<host>:<port>?sessionId=<token>`

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const SCHEME: &str = "tcp://";
const SESSION_QUERY: &str = "?sessionId=";

/// Shared secret the worker echoes back right after connecting.
///
/// Always ASCII; the worker sends exactly `len()` raw bytes with no prefix or delimiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Random token (hyphenated UUID v4, 36 ASCII bytes).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn parse(s: impl Into<String>) -> Result<Self, DescriptorError> {
        let s = s.into();
        if s.is_empty() {
            return Err(DescriptorError::EmptySession);
        }
        // '&' and '#' would break the query part of the descriptor
        if !s.bytes().all(|b| b.is_ascii_graphic() && b != b'&' && b != b'#') {
            return Err(DescriptorError::InvalidSession(s));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Number of bytes the worker must send during the handshake.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = DescriptorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("connection descriptor must start with 'tcp://': {0}")]
    Scheme(String),
    #[error("connection descriptor has no '?sessionId=' part: {0}")]
    MissingSession(String),
    #[error("invalid address in connection descriptor: {0}")]
    Address(String),
    #[error("session id must not be empty")]
    EmptySession,
    #[error("session id must be printable ASCII without '&' or '#': {0:?}")]
    InvalidSession(String),
}

/// Where and how the worker connects back to its channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub addr: SocketAddr,
    pub session_id: SessionId,
}

impl ConnectionDescriptor {
    pub fn new(addr: SocketAddr, session_id: SessionId) -> Self {
        Self { addr, session_id }
    }

    pub fn host(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SocketAddr brackets IPv6 hosts, which keeps host:port unambiguous
        write!(f, "{SCHEME}{}{SESSION_QUERY}{}", self.addr, self.session_id)
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| DescriptorError::Scheme(s.to_string()))?;
        let (addr, session) = rest
            .split_once(SESSION_QUERY)
            .ok_or_else(|| DescriptorError::MissingSession(s.to_string()))?;
        let addr = addr
            .parse::<SocketAddr>()
            .map_err(|_| DescriptorError::Address(addr.to_string()))?;
        let session_id = SessionId::parse(session)?;
        Ok(Self { addr, session_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn descriptor_format() {
        let descriptor = ConnectionDescriptor::new(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 49152)),
            SessionId::parse("abc123").unwrap(),
        );
        insta::assert_snapshot!(descriptor.to_string(), @"tcp://127.0.0.1:49152?sessionId=abc123");
    }

    #[test]
    fn ipv6_descriptor_parses_back() {
        let descriptor = ConnectionDescriptor::new(
            SocketAddr::from((Ipv6Addr::LOCALHOST, 40000)),
            SessionId::parse("abc123").unwrap(),
        );
        let text = descriptor.to_string();
        assert_eq!(text, "tcp://[::1]:40000?sessionId=abc123");
        assert_eq!(text.parse::<ConnectionDescriptor>().unwrap(), descriptor);
    }

    #[test]
    fn parses_worker_descriptor() {
        let descriptor: ConnectionDescriptor =
            "tcp://127.0.0.1:5000?sessionId=2b8f1c4e".parse().unwrap();
        assert_eq!(descriptor.host(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(descriptor.port(), 5000);
        assert_eq!(descriptor.session_id.as_str(), "2b8f1c4e");
    }

    #[test]
    fn rejects_malformed_descriptors() {
        assert!(matches!(
            "udp://127.0.0.1:1?sessionId=x".parse::<ConnectionDescriptor>(),
            Err(DescriptorError::Scheme(_))
        ));
        assert!(matches!(
            "tcp://127.0.0.1:1".parse::<ConnectionDescriptor>(),
            Err(DescriptorError::MissingSession(_))
        ));
        assert!(matches!(
            "tcp://localhost?sessionId=x".parse::<ConnectionDescriptor>(),
            Err(DescriptorError::Address(_))
        ));
        assert!(matches!(
            "tcp://127.0.0.1:1?sessionId=".parse::<ConnectionDescriptor>(),
            Err(DescriptorError::EmptySession)
        ));
    }

    #[test]
    fn generated_session_is_ascii() {
        let id = SessionId::generate();
        assert_eq!(id.len(), 36);
        assert!(id.as_str().is_ascii());
        assert_ne!(id, SessionId::generate());
    }

    #[test]
    fn session_rejects_non_ascii_and_separators() {
        assert!(SessionId::parse("ünïcode").is_err());
        assert!(SessionId::parse("a b").is_err());
        assert!(SessionId::parse("a&b").is_err());
    }
}
