//! Cryptography Abstraction
//!
//! The sync core never touches key material or ciphertext itself. It hands
//! downloaded messages to a [`MessageCrypto`] implementation together with an
//! opaque [`KeyRing`] for the owning address and receives an RFC 822 literal.

use bytes::Bytes;

use crate::api::{Address, FullMessage};
use crate::error::Result;

/// Unlocked key material of one address.
///
/// The content is opaque to the core and only interpreted by the
/// [`MessageCrypto`] implementation that produced it.
#[derive(Clone)]
pub struct KeyRing {
    pub address_id: String,
    material: Bytes,
}

impl KeyRing {
    pub fn new(address_id: impl Into<String>, material: impl Into<Bytes>) -> Self {
        Self {
            address_id: address_id.into(),
            material: material.into(),
        }
    }

    pub fn material(&self) -> &Bytes {
        &self.material
    }
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("address_id", &self.address_id)
            .field("material", &"[REDACTED]")
            .finish()
    }
}

/// Decrypts and assembles messages.
///
/// Methods are synchronous and CPU-bound; callers run them on blocking
/// worker threads.
pub trait MessageCrypto: Send + Sync {
    /// Unlock the keys of `address`.
    fn unlock_address_keys(&self, address: &Address) -> Result<KeyRing>;

    /// Decrypt `message` and assemble its RFC 822 literal.
    fn build_rfc822(&self, keyring: &KeyRing, message: &FullMessage) -> Result<Vec<u8>>;
}
