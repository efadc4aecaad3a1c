//! Length-prefixed framing
//!
//! Every blob that crosses a byte stream (packed command messages, hails on
//! the QUIC control stream) is framed the same way:
//!
//! ```text
//! ┌─────────────┬─────────────────────────────────┐
//! │ Length (4B) │ Payload                         │
//! └─────────────┴─────────────────────────────────┘
//! ```
//!
//! The length is big-endian and covers the payload only.

// ============================================================================
// Constants
// ============================================================================

/// Maximum frame payload (file chunks travel as raw data, keep headroom)
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Length of the frame header (4 bytes for length)
pub const HEADER_LEN: usize = 4;

// ============================================================================
// Encoding/Decoding
// ============================================================================

/// Frame a payload
///
/// Returns a Vec containing: [4-byte BE length][payload]
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(FrameError::TooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);

    Ok(buf)
}

/// Decode one frame from the front of `buf`
///
/// Returns the payload slice and the number of bytes consumed
pub fn decode_frame(buf: &[u8]) -> Result<(&[u8], usize), FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::Incomplete(HEADER_LEN - buf.len()));
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE as usize {
        return Err(FrameError::TooLarge(length));
    }

    let total_len = HEADER_LEN + length;
    if buf.len() < total_len {
        return Err(FrameError::Incomplete(total_len - buf.len()));
    }

    Ok((&buf[HEADER_LEN..total_len], total_len))
}

/// Decode a buffer that must hold exactly one frame
pub fn decode_exact(buf: &[u8]) -> Result<&[u8], FrameError> {
    let (payload, consumed) = decode_frame(buf)?;
    if consumed != buf.len() {
        return Err(FrameError::TrailingBytes(buf.len() - consumed));
    }
    Ok(payload)
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while framing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough data (need N more bytes)
    Incomplete(usize),
    /// Frame exceeds maximum size
    TooLarge(usize),
    /// Buffer holds bytes past the end of the frame
    TrailingBytes(usize),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Incomplete(needed) => {
                write!(f, "incomplete frame, need {} more bytes", needed)
            }
            FrameError::TooLarge(size) => {
                write!(f, "frame too large: {} bytes (max {})", size, MAX_FRAME_SIZE)
            }
            FrameError::TrailingBytes(extra) => {
                write!(f, "{} trailing bytes after frame", extra)
            }
        }
    }
}

impl std::error::Error for FrameError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_frame() {
        let encoded = encode_frame(b"hello").unwrap();
        assert_eq!(&encoded[..4], &[0, 0, 0, 5]);

        let (payload, consumed) = decode_frame(&encoded).unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_empty_payload() {
        let encoded = encode_frame(&[]).unwrap();
        assert_eq!(encoded, vec![0, 0, 0, 0]);
        assert!(decode_exact(&encoded).unwrap().is_empty());
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode_frame(b"payload").unwrap();

        assert!(matches!(
            decode_frame(&encoded[..2]),
            Err(FrameError::Incomplete(2))
        ));
        assert!(matches!(
            decode_frame(&encoded[..encoded.len() - 1]),
            Err(FrameError::Incomplete(1))
        ));
    }

    #[test]
    fn test_decode_exact_rejects_trailing() {
        let mut encoded = encode_frame(b"abc").unwrap();
        encoded.push(0xff);
        assert_eq!(decode_exact(&encoded), Err(FrameError::TrailingBytes(1)));
    }

    #[test]
    fn test_frame_too_large() {
        let fake_header = (MAX_FRAME_SIZE + 1).to_be_bytes();
        assert!(matches!(
            decode_frame(&fake_header),
            Err(FrameError::TooLarge(_))
        ));
    }
}
