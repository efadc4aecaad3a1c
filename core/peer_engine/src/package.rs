//! Command envelopes
//!
//! A [`Package`] is the routing envelope every command travels in: a 64-bit
//! command id plus an optional bincode-serialized payload. The engine never
//! looks inside the payload; handlers decode it with [`Package::content`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::packer::PackError;

/// Command envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Command identifier (opaque routing key)
    pub id: u64,
    /// Serialized payload, `None` for id-only commands
    pub content: Option<Vec<u8>>,
}

impl Package {
    /// Envelope carrying a typed payload
    pub fn new<T: Serialize>(id: u64, content: &T) -> Result<Self, PackError> {
        let content =
            bincode::serialize(content).map_err(|e| PackError::Serialization(e.to_string()))?;
        Ok(Self {
            id,
            content: Some(content),
        })
    }

    /// Envelope for a command without payload
    pub fn empty(id: u64) -> Self {
        Self { id, content: None }
    }

    /// Decode the payload as `T`
    pub fn content<T: DeserializeOwned>(&self) -> Result<T, PackError> {
        let bytes = self.content.as_deref().ok_or(PackError::MissingContent)?;
        bincode::deserialize(bytes).map_err(|e| PackError::Deserialization(e.to_string()))
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }
}

/// Result of unpacking a received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unpacked {
    pub package: Package,
    /// Raw bytes sent alongside the envelope without serialization
    pub raw_data: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct RoomMessage {
        room: String,
        text: String,
    }

    #[test]
    fn test_typed_content() {
        let msg = RoomMessage {
            room: "main".to_string(),
            text: "hi".to_string(),
        };
        let package = Package::new(0x80010, &msg).unwrap();

        assert_eq!(package.id, 0x80010);
        assert!(package.has_content());
        assert_eq!(package.content::<RoomMessage>().unwrap(), msg);
    }

    #[test]
    fn test_empty_package_has_no_content() {
        let package = Package::empty(0x80040);
        assert!(!package.has_content());
        assert_eq!(
            package.content::<String>(),
            Err(PackError::MissingContent)
        );
    }

    #[test]
    fn test_content_type_mismatch() {
        let package = Package::new(1, &7u8).unwrap();
        assert!(matches!(
            package.content::<RoomMessage>(),
            Err(PackError::Deserialization(_))
        ));
    }
}
