//! Secret key material: per-entity 256-bit symmetric keys, zeroized on drop.

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// A 256-bit symmetric key owned by a single access descriptor.
///
/// Serialized as base64 inside manifest plaintext (which is itself encrypted
/// with the *parent*'s key before it ever reaches storage).
#[derive(Clone)]
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    /// Generate a random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for SecretKey {}

impl Serialize for SecretKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        serializer.serialize_str(&STANDARD.encode(self.bytes))
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let s = String::deserialize(deserializer)?;
        let raw = STANDARD
            .decode(&s)
            .map_err(|e| serde::de::Error::custom(format!("base64 key: {e}")))?;
        if raw.len() != KEY_SIZE {
            return Err(serde::de::Error::custom(format!(
                "key has wrong size: {} bytes (expected {KEY_SIZE})",
                raw.len()
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&raw);
        Ok(Self { bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        let k1 = SecretKey::generate();
        let k2 = SecretKey::generate();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn serde_roundtrip() {
        let key = SecretKey::generate();
        let json = serde_json::to_string(&key).unwrap();
        let back: SecretKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
    }

    #[test]
    fn wrong_size_rejected() {
        let result = serde_json::from_str::<SecretKey>("\"AAAA\"");
        assert!(result.is_err());
    }

    #[test]
    fn debug_redacts() {
        let key = SecretKey::from_bytes([7u8; KEY_SIZE]);
        let dbg = format!("{key:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains('7'));
    }
}
