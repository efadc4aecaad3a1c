//! Hail payloads attached to connection requests and approvals
//!
//! # Format (all integers big-endian)
//!
//! ```text
//! Service hail (sent to the rendezvous node):
//! +----------------+----------------+--------+-----------------+-----------+
//! | Nick len (4B)  | Nick (UTF-8)   | Family | Address (4/16B) | Port (2B) |
//! +----------------+----------------+--------+-----------------+-----------+
//!
//! Peer hail (sent to / approved for another peer):
//! +----------------+----------------+----------------+----------------------+
//! | Nick len (4B)  | Nick (UTF-8)   | Key len (i32)  | Public key bytes     |
//! +----------------+----------------+----------------+----------------------+
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// ============================================================================
// Constants
// ============================================================================

/// Address family marker for IPv4 endpoints
const FAMILY_V4: u8 = 4;

/// Address family marker for IPv6 endpoints
const FAMILY_V6: u8 = 6;

/// Upper bound on the nickname field
pub const MAX_NICKNAME_LEN: usize = 1024;

/// Upper bound on the public key field
pub const MAX_PUBLIC_KEY_LEN: usize = 1024;

// ============================================================================
// Hail Types
// ============================================================================

/// Hail sent to the service node when opening the rendezvous connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHail {
    /// Local nickname
    pub nickname: String,
    /// Locally reachable endpoint of the peer socket
    pub local_endpoint: SocketAddr,
}

/// Hail exchanged between peers carrying key agreement material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHail {
    /// Identity of the sender (becomes the connection tag)
    pub nickname: String,
    /// Public key blob of the sender
    pub public_key: Vec<u8>,
}

impl ServiceHail {
    pub fn encode(&self) -> Result<Vec<u8>, HailError> {
        let mut buf = Vec::with_capacity(4 + self.nickname.len() + 19);
        write_string(&mut buf, &self.nickname)?;
        write_endpoint(&mut buf, self.local_endpoint);
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, HailError> {
        let mut reader = Reader::new(data);
        let nickname = reader.string()?;
        let local_endpoint = reader.endpoint()?;
        reader.finish()?;

        Ok(Self {
            nickname,
            local_endpoint,
        })
    }
}

impl PeerHail {
    pub fn encode(&self) -> Result<Vec<u8>, HailError> {
        if self.public_key.len() > MAX_PUBLIC_KEY_LEN {
            return Err(HailError::FieldTooLong(self.public_key.len()));
        }

        let mut buf = Vec::with_capacity(8 + self.nickname.len() + self.public_key.len());
        write_string(&mut buf, &self.nickname)?;
        buf.extend_from_slice(&(self.public_key.len() as i32).to_be_bytes());
        buf.extend_from_slice(&self.public_key);
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, HailError> {
        let mut reader = Reader::new(data);
        let nickname = reader.string()?;

        let key_len = reader.i32()?;
        if key_len < 0 {
            return Err(HailError::NegativeLength(key_len));
        }
        let key_len = key_len as usize;
        if key_len > MAX_PUBLIC_KEY_LEN {
            return Err(HailError::FieldTooLong(key_len));
        }
        let public_key = reader.bytes(key_len)?.to_vec();
        reader.finish()?;

        if nickname.is_empty() {
            return Err(HailError::EmptyNickname);
        }

        Ok(Self {
            nickname,
            public_key,
        })
    }
}

// ============================================================================
// Writers
// ============================================================================

fn write_string(buf: &mut Vec<u8>, value: &str) -> Result<(), HailError> {
    if value.len() > MAX_NICKNAME_LEN {
        return Err(HailError::FieldTooLong(value.len()));
    }
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn write_endpoint(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(FAMILY_V4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(FAMILY_V6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

// ============================================================================
// Reader
// ============================================================================

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], HailError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(HailError::Truncated)?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], HailError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn i32(&mut self) -> Result<i32, HailError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String, HailError> {
        let len = u32::from_be_bytes(self.array()?) as usize;
        if len > MAX_NICKNAME_LEN {
            return Err(HailError::FieldTooLong(len));
        }
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| HailError::InvalidUtf8)
    }

    fn endpoint(&mut self) -> Result<SocketAddr, HailError> {
        let [family] = self.array::<1>()?;
        let ip = match family {
            FAMILY_V4 => IpAddr::V4(Ipv4Addr::from(self.array::<4>()?)),
            FAMILY_V6 => IpAddr::V6(Ipv6Addr::from(self.array::<16>()?)),
            other => return Err(HailError::UnknownFamily(other)),
        };
        let port = u16::from_be_bytes(self.array()?);
        Ok(SocketAddr::new(ip, port))
    }

    fn finish(&self) -> Result<(), HailError> {
        if self.pos != self.data.len() {
            return Err(HailError::TrailingBytes(self.data.len() - self.pos));
        }
        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while encoding or decoding a hail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HailError {
    /// Payload ended before all fields were read
    Truncated,
    /// Nickname is not valid UTF-8
    InvalidUtf8,
    /// Nickname is empty
    EmptyNickname,
    /// A length field exceeds its limit
    FieldTooLong(usize),
    /// Key length field is negative
    NegativeLength(i32),
    /// Endpoint family byte is not 4 or 6
    UnknownFamily(u8),
    /// Bytes left over after the last field
    TrailingBytes(usize),
}

impl fmt::Display for HailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HailError::Truncated => write!(f, "hail truncated"),
            HailError::InvalidUtf8 => write!(f, "hail nickname is not valid UTF-8"),
            HailError::EmptyNickname => write!(f, "hail nickname is empty"),
            HailError::FieldTooLong(len) => write!(f, "hail field too long: {} bytes", len),
            HailError::NegativeLength(len) => write!(f, "negative key length {}", len),
            HailError::UnknownFamily(family) => write!(f, "unknown address family {}", family),
            HailError::TrailingBytes(n) => write!(f, "{} trailing bytes after hail", n),
        }
    }
}

impl std::error::Error for HailError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_hail_layout() {
        let hail = PeerHail {
            nickname: "bob".to_string(),
            public_key: vec![0xAA; 32],
        };

        let encoded = hail.encode().unwrap();

        assert_eq!(&encoded[..4], &[0, 0, 0, 3]);
        assert_eq!(&encoded[4..7], b"bob");
        assert_eq!(&encoded[7..11], &32i32.to_be_bytes());
        assert_eq!(&encoded[11..], &[0xAA; 32][..]);
        assert_eq!(PeerHail::decode(&encoded).unwrap(), hail);
    }

    #[test]
    fn test_service_hail_ipv4_layout() {
        // 203.0.113.5:54321 → family 4, CB 00 71 05, D4 31
        let hail = ServiceHail {
            nickname: "alice".to_string(),
            local_endpoint: "203.0.113.5:54321".parse().unwrap(),
        };

        let encoded = hail.encode().unwrap();

        assert_eq!(encoded.len(), 4 + 5 + 1 + 4 + 2);
        assert_eq!(encoded[9], 4);
        assert_eq!(&encoded[10..14], &[203, 0, 113, 5]);
        assert_eq!(&encoded[14..16], &[0xD4, 0x31]);
        assert_eq!(ServiceHail::decode(&encoded).unwrap(), hail);
    }

    #[test]
    fn test_service_hail_ipv6() {
        let hail = ServiceHail {
            nickname: "alice".to_string(),
            local_endpoint: "[2001:db8::1]:9000".parse().unwrap(),
        };

        let encoded = hail.encode().unwrap();
        assert_eq!(encoded[9], 6);
        assert_eq!(ServiceHail::decode(&encoded).unwrap(), hail);
    }

    #[test]
    fn test_truncated_peer_hail() {
        let encoded = PeerHail {
            nickname: "bob".to_string(),
            public_key: vec![1; 32],
        }
        .encode()
        .unwrap();

        assert_eq!(
            PeerHail::decode(&encoded[..encoded.len() - 1]),
            Err(HailError::Truncated)
        );
        assert_eq!(PeerHail::decode(&[]), Err(HailError::Truncated));
    }

    #[test]
    fn test_negative_key_length() {
        let mut buf = Vec::new();
        write_string(&mut buf, "bob").unwrap();
        buf.extend_from_slice(&(-1i32).to_be_bytes());

        assert_eq!(PeerHail::decode(&buf), Err(HailError::NegativeLength(-1)));
    }

    #[test]
    fn test_empty_nickname_rejected() {
        let encoded = PeerHail {
            nickname: String::new(),
            public_key: vec![1; 32],
        }
        .encode()
        .unwrap();

        assert_eq!(PeerHail::decode(&encoded), Err(HailError::EmptyNickname));
    }

    #[test]
    fn test_invalid_utf8_nickname() {
        let mut buf = vec![0, 0, 0, 2, 0xC3, 0x28];
        buf.extend_from_slice(&0i32.to_be_bytes());

        assert_eq!(PeerHail::decode(&buf), Err(HailError::InvalidUtf8));
    }

    #[test]
    fn test_unknown_family() {
        let mut buf = Vec::new();
        write_string(&mut buf, "alice").unwrap();
        buf.push(9);

        assert_eq!(ServiceHail::decode(&buf), Err(HailError::UnknownFamily(9)));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut encoded = PeerHail {
            nickname: "bob".to_string(),
            public_key: vec![],
        }
        .encode()
        .unwrap();
        encoded.push(0);

        assert_eq!(PeerHail::decode(&encoded), Err(HailError::TrailingBytes(1)));
    }
}
