//! Authenticated encryption of manifests and content blocks.
//!
//! Blob format: `[24-byte random nonce][ciphertext][16-byte tag]`.
//! Blocks additionally go through zstd before encryption, so the on-disk and
//! on-wire size of a block is the compressed size plus 40 bytes of overhead.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::keys::SecretKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// zstd level for block payloads. Level 3 keeps block writes cheap without
/// giving up much ratio.
const ZSTD_LEVEL: i32 = 3;

/// Encrypt a plaintext blob with XChaCha20-Poly1305.
///
/// Returns `[24-byte nonce][ciphertext][16-byte tag]`.
pub fn encrypt(key: &SecretKey, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt a blob produced by [`encrypt`].
///
/// Any failure (wrong key, truncation, bit flip) is reported as an error and
/// must be treated as corruption by the caller, never as a cache miss.
pub fn decrypt(key: &SecretKey, encrypted: &[u8]) -> anyhow::Result<Vec<u8>> {
    if encrypted.len() < NONCE_SIZE + TAG_SIZE {
        anyhow::bail!(
            "encrypted blob too short: {} bytes (minimum {})",
            encrypted.len(),
            NONCE_SIZE + TAG_SIZE
        );
    }

    let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| anyhow::anyhow!("decryption failed: invalid key or corrupted data"))
}

/// Compress then encrypt a block payload.
pub fn seal_block(key: &SecretKey, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let compressed = zstd::stream::encode_all(plaintext, ZSTD_LEVEL)
        .map_err(|e| anyhow::anyhow!("zstd compression failed: {e}"))?;
    encrypt(key, &compressed)
}

/// Decrypt then decompress a block payload produced by [`seal_block`].
pub fn open_block(key: &SecretKey, sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
    let compressed = decrypt(key, sealed)?;
    zstd::stream::decode_all(compressed.as_slice())
        .map_err(|e| anyhow::anyhow!("zstd decompression failed: {e}"))
}

/// BLAKE3 digest of a plaintext, hex-encoded. Recorded in block accesses and
/// verified on fetch.
pub fn digest(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = SecretKey::generate();
        let plaintext = b"hello, encrypted world!";

        let encrypted = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &encrypted).unwrap();

        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn encrypt_decrypt_empty() {
        let key = SecretKey::generate();
        let encrypted = encrypt(&key, b"").unwrap();
        assert_eq!(decrypt(&key, &encrypted).unwrap(), b"");
    }

    #[test]
    fn decrypt_wrong_key_fails() {
        let encrypted = encrypt(&SecretKey::generate(), b"secret data").unwrap();
        assert!(decrypt(&SecretKey::generate(), &encrypted).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = SecretKey::generate();
        let mut encrypted = encrypt(&key, b"secret data").unwrap();
        // Flip a byte in the ciphertext (after nonce)
        encrypted[25] ^= 0xFF;
        assert!(decrypt(&key, &encrypted).is_err());
    }

    #[test]
    fn truncated_blob_fails() {
        let key = SecretKey::generate();
        assert!(decrypt(&key, &[0u8; 10]).is_err());
    }

    #[test]
    fn block_seal_open_roundtrip() {
        let key = SecretKey::generate();
        let payload = vec![0x5Au8; 64 * 1024];

        let sealed = seal_block(&key, &payload).unwrap();
        // Uniform payload compresses well below the plaintext size.
        assert!(sealed.len() < payload.len());
        assert_eq!(open_block(&key, &sealed).unwrap(), payload);
    }

    #[test]
    fn digest_is_stable() {
        assert_eq!(digest(b"abc"), digest(b"abc"));
        assert_ne!(digest(b"abc"), digest(b"abd"));
        assert_eq!(digest(b"").len(), 64);
    }

    mod proptest_suite {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn roundtrip_any_payload(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
                let key = SecretKey::generate();
                let sealed = seal_block(&key, &data).unwrap();
                prop_assert_eq!(open_block(&key, &sealed).unwrap(), data);
            }
        }
    }
}
