//! saltfs-crypto: client-side encryption primitives for the saltfs engine
//!
//! Everything a manifest or block touches before leaving the machine goes
//! through this crate:
//!
//! ```text
//! manifest plaintext ──────────────► encrypt ──► vlob ciphertext
//! block plaintext ──► zstd compress ──► encrypt ──► block ciphertext
//! ```
//!
//! Encrypted blob format (binary): `[24-byte random nonce][ciphertext][16-byte tag]`.
//! Every stored entity carries its own random 256-bit [`SecretKey`]; there is
//! no key hierarchy here; key distribution is the caller's concern.

pub mod blob;
pub mod keys;

pub use blob::{decrypt, digest, encrypt, open_block, seal_block};
pub use keys::SecretKey;

/// Size of a secret key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Generate a fresh random entity id.
pub fn fresh_id() -> uuid::Uuid {
    uuid::Uuid::new_v4()
}
