//! Link key agreement
//!
//! Each engine owns one static X25519 key pair for its whole lifetime. When a
//! peer hail arrives, the remote public key is combined with the local secret
//! and the shared secret is stretched with HKDF-SHA256 into the symmetric key
//! the link's [`Packer`](crate::packer::Packer) uses.

use std::fmt;

use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use x25519_dalek::{PublicKey, StaticSecret};

// ============================================================================
// Constants
// ============================================================================

/// Length of an encoded X25519 public key
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of the derived symmetric link key
pub const LINK_KEY_LEN: usize = 32;

/// HKDF info label binding derived keys to this protocol
const KDF_INFO: &[u8] = b"peer-chat link key v1";

// ============================================================================
// Key Exchange
// ============================================================================

/// Static key pair used for every link of one engine
pub struct KeyExchange {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyExchange {
    /// Generate a fresh key pair from the system CSPRNG
    pub fn generate(rng: &SystemRandom) -> Result<Self, CryptoError> {
        let mut seed = [0u8; 32];
        rng.fill(&mut seed).map_err(|_| CryptoError::Rng)?;
        let secret = StaticSecret::from(seed);
        seed.fill(0);

        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Public key blob carried in peer hails
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    /// Derive the symmetric key shared with the owner of `remote_public`
    pub fn derive_link_key(&self, remote_public: &[u8]) -> Result<[u8; LINK_KEY_LEN], CryptoError> {
        let remote: [u8; PUBLIC_KEY_LEN] = remote_public
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey(remote_public.len()))?;

        let shared = self.secret.diffie_hellman(&PublicKey::from(remote));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }

        expand_shared_secret(shared.as_bytes())
    }
}

impl fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

/// HKDF-SHA256 extract-and-expand of a raw shared secret
fn expand_shared_secret(shared: &[u8]) -> Result<[u8; LINK_KEY_LEN], CryptoError> {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]);
    let prk = salt.extract(shared);
    let okm = prk
        .expand(&[KDF_INFO], hkdf::HKDF_SHA256)
        .map_err(|_| CryptoError::KeyDerivation)?;

    let mut key = [0u8; LINK_KEY_LEN];
    okm.fill(&mut key).map_err(|_| CryptoError::KeyDerivation)?;
    Ok(key)
}

// ============================================================================
// Error Types
// ============================================================================

/// Key agreement failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// System random generator failed
    Rng,
    /// Remote key blob has the wrong length
    InvalidPublicKey(usize),
    /// Remote key is a low-order point (shared secret is all zeros)
    NonContributory,
    /// HKDF expansion failed
    KeyDerivation,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::Rng => write!(f, "random generator failure"),
            CryptoError::InvalidPublicKey(len) => write!(
                f,
                "invalid public key length {} (expected {})",
                len, PUBLIC_KEY_LEN
            ),
            CryptoError::NonContributory => write!(f, "remote public key is not contributory"),
            CryptoError::KeyDerivation => write!(f, "key derivation failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

// ============================================================================
// Tests
// ============================================================================
