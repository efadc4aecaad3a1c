//! Per-link message encryption
//!
//! # Packed message layout
//!
//! ```text
//! plaintext:  [4B len][bincode Package][raw flag (1B)][raw bytes...]
//! blob:       [4B len][nonce (12B)][ChaCha20-Poly1305 ciphertext + tag (16B)]
//! ```
//!
//! The nonce is drawn from the system CSPRNG for every message, so the same
//! key can seal in both directions without coordinating counters.

use std::fmt;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use crate::crypto::LINK_KEY_LEN;
use crate::framing::{self, FrameError};
use crate::package::{Package, Unpacked};

/// Raw flag: no raw segment follows the envelope
const RAW_ABSENT: u8 = 0;

/// Raw flag: the rest of the plaintext is the raw segment
const RAW_PRESENT: u8 = 1;

// ============================================================================
// Packer
// ============================================================================

/// Encryptor/decryptor bound to one link key
pub struct Packer {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl Packer {
    pub fn new(key: &[u8; LINK_KEY_LEN]) -> Result<Self, PackError> {
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| PackError::InvalidKey)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Serialize and encrypt an envelope with optional raw data
    pub fn pack(&self, package: &Package, raw_data: Option<&[u8]>) -> Result<Vec<u8>, PackError> {
        let envelope =
            bincode::serialize(package).map_err(|e| PackError::Serialization(e.to_string()))?;

        let mut in_out = framing::encode_frame(&envelope)?;
        match raw_data {
            Some(raw) => {
                in_out.push(RAW_PRESENT);
                in_out.extend_from_slice(raw);
            }
            None => in_out.push(RAW_ABSENT),
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| PackError::Rng)?;

        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| PackError::Encryption)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);

        Ok(framing::encode_frame(&sealed)?)
    }

    /// Decrypt and deserialize a blob produced by [`Packer::pack`]
    pub fn unpack(&self, blob: &[u8]) -> Result<Unpacked, PackError> {
        let sealed = framing::decode_exact(blob)?;
        if sealed.len() < NONCE_LEN + CHACHA20_POLY1305.tag_len() {
            return Err(PackError::Truncated);
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce =
            Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| PackError::Truncated)?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| PackError::Authentication)?;

        let (envelope, consumed) = framing::decode_frame(plaintext)?;
        let package: Package = bincode::deserialize(envelope)
            .map_err(|e| PackError::Deserialization(e.to_string()))?;

        let raw_data = match plaintext[consumed..].split_first() {
            Some((&RAW_ABSENT, [])) => None,
            Some((&RAW_ABSENT, rest)) => return Err(PackError::TrailingBytes(rest.len())),
            Some((&RAW_PRESENT, raw)) => Some(raw.to_vec()),
            Some((&flag, _)) => return Err(PackError::InvalidRawFlag(flag)),
            None => return Err(PackError::Truncated),
        };

        Ok(Unpacked { package, raw_data })
    }
}

impl fmt::Debug for Packer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packer")
            .field("algorithm", self.key.algorithm())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while packing or unpacking a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackError {
    /// Length framing is malformed
    Frame(FrameError),
    /// Envelope could not be serialized
    Serialization(String),
    /// Envelope could not be deserialized
    Deserialization(String),
    /// Package has no payload to decode
    MissingContent,
    /// Key rejected by the cipher
    InvalidKey,
    /// System random generator failed
    Rng,
    /// Sealing failed
    Encryption,
    /// Ciphertext failed the authentication check
    Authentication,
    /// Blob shorter than nonce + tag, or plaintext missing the raw flag
    Truncated,
    /// Unknown raw segment flag
    InvalidRawFlag(u8),
    /// Bytes after an envelope that declared no raw segment
    TrailingBytes(usize),
}

impl From<FrameError> for PackError {
    fn from(e: FrameError) -> Self {
        PackError::Frame(e)
    }
}

impl fmt::Display for PackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackError::Frame(e) => write!(f, "framing error: {}", e),
            PackError::Serialization(e) => write!(f, "serialization error: {}", e),
            PackError::Deserialization(e) => write!(f, "deserialization error: {}", e),
            PackError::MissingContent => write!(f, "package has no content"),
            PackError::InvalidKey => write!(f, "invalid link key"),
            PackError::Rng => write!(f, "random generator failure"),
            PackError::Encryption => write!(f, "encryption failed"),
            PackError::Authentication => write!(f, "message authentication failed"),
            PackError::Truncated => write!(f, "packed message truncated"),
            PackError::InvalidRawFlag(flag) => write!(f, "invalid raw data flag {}", flag),
            PackError::TrailingBytes(n) => write!(f, "{} trailing bytes after envelope", n),
        }
    }
}

impl std::error::Error for PackError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn packer(byte: u8) -> Packer {
        Packer::new(&[byte; LINK_KEY_LEN]).unwrap()
    }

    #[test]
    fn test_round_trip_with_raw_data() {
        let p = packer(7);
        let package = Package::new(0x80010, &"hi".to_string()).unwrap();

        let blob = p.pack(&package, Some(b"file chunk")).unwrap();
        let unpacked = p.unpack(&blob).unwrap();

        assert_eq!(unpacked.package, package);
        assert_eq!(unpacked.raw_data.as_deref(), Some(&b"file chunk"[..]));
    }

    #[test]
    fn test_round_trip_empty_and_absent_raw() {
        let p = packer(7);
        let package = Package::empty(0x80040);

        let with_empty = p.unpack(&p.pack(&package, Some(&[])).unwrap()).unwrap();
        assert_eq!(with_empty.raw_data, Some(Vec::new()));

        let without = p.unpack(&p.pack(&package, None).unwrap()).unwrap();
        assert_eq!(without.raw_data, None);
        assert_eq!(without.package, package);
    }

    #[test]
    fn test_ciphertext_hides_payload() {
        let p = packer(7);
        let package = Package::new(1, &"secret words".to_string()).unwrap();

        let blob = p.pack(&package, None).unwrap();

        assert!(!blob.windows(12).any(|w| w == b"secret words"));
    }

    #[test]
    fn test_fresh_nonce_per_message() {
        let p = packer(7);
        let package = Package::empty(1);
        assert_ne!(p.pack(&package, None).unwrap(), p.pack(&package, None).unwrap());
    }

    #[test]
    fn test_corrupted_blob_fails_authentication() {
        let p = packer(7);
        let mut blob = p.pack(&Package::empty(1), Some(b"data")).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;

        assert_eq!(p.unpack(&blob), Err(PackError::Authentication));
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let blob = packer(1).pack(&Package::empty(1), None).unwrap();
        assert_eq!(packer(2).unpack(&blob), Err(PackError::Authentication));
    }

    #[test]
    fn test_truncated_blob() {
        let p = packer(7);
        assert!(matches!(p.unpack(&[0, 0]), Err(PackError::Frame(FrameError::Incomplete(_)))));

        let short = framing::encode_frame(&[0u8; 8]).unwrap();
        assert_eq!(p.unpack(&short), Err(PackError::Truncated));
    }
}
