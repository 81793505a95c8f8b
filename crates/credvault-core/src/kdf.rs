//! Key derivation.
//!
//! `derive_key`: PBKDF2-HMAC-SHA256, turns the master password and the
//!   per-installation salt into the 32-byte active key.
//!
//! `subkey`: HKDF-SHA256, expands the active key with an envelope's own salt
//!   so every record is sealed under a distinct key.

use std::fmt;
use std::sync::Arc;

use hkdf::Hkdf;
use hmac::Hmac;
use rand::RngCore;
use sha2::Sha256;
use tracing::error;
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
/// Floor and default for the PBKDF2 iteration count.
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

/// Opaque handle to a 256-bit key. Zeroized when the last clone drops.
#[derive(Clone)]
pub struct KeyHandle(Arc<Zeroizing<[u8; KEY_LEN]>>);

impl KeyHandle {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Arc::new(Zeroizing::new(bytes)))
    }

    /// Fresh random key, used by tests and for one-off keys.
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        rand::rngs::OsRng.fill_bytes(&mut bytes[..]);
        Self::from_bytes(*bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyHandle(..)")
    }
}

/// Derive the active key with the default iteration count.
pub fn derive_key(password: &str, salt: &[u8]) -> Result<KeyHandle> {
    derive_key_with_iterations(password, salt, MIN_KDF_ITERATIONS)
}

/// Derive with an explicit iteration count. Counts below the floor are raised
/// to it.
pub fn derive_key_with_iterations(password: &str, salt: &[u8], iterations: u32) -> Result<KeyHandle> {
    let rounds = iterations.max(MIN_KDF_ITERATIONS);
    let mut output = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, rounds, &mut output[..]).map_err(
        |e| {
            error!("pbkdf2 derive failed: {e}");
            VaultError::KeyDerivation
        },
    )?;
    Ok(KeyHandle::from_bytes(*output))
}

/// Expand `key` into a per-envelope key bound to `salt` and `info`.
pub fn subkey(key: &KeyHandle, salt: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), key.as_bytes());
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(info, &mut out[..]).map_err(|e| {
        error!("hkdf expand failed: {e}");
        VaultError::KeyDerivation
    })?;
    Ok(out)
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let salt = [7u8; SALT_LEN];
        let a = derive_key("correct horse battery staple", &salt).unwrap();
        let b = derive_key("correct horse battery staple", &salt).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn salt_and_password_change_the_key() {
        let a = derive_key("pw-one", &[1u8; SALT_LEN]).unwrap();
        let b = derive_key("pw-one", &[2u8; SALT_LEN]).unwrap();
        let c = derive_key("pw-two", &[1u8; SALT_LEN]).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn low_iteration_counts_are_raised_to_the_floor() {
        let salt = [3u8; SALT_LEN];
        let floor = derive_key("pw", &salt).unwrap();
        let low = derive_key_with_iterations("pw", &salt, 10).unwrap();
        assert_eq!(floor.as_bytes(), low.as_bytes());
    }

    #[test]
    fn subkeys_differ_per_salt() {
        let key = KeyHandle::generate();
        let a = subkey(&key, &[1u8; SALT_LEN], b"info").unwrap();
        let b = subkey(&key, &[2u8; SALT_LEN], b"info").unwrap();
        assert_ne!(*a, *b);
    }

    #[test]
    fn debug_hides_key_material() {
        let key = KeyHandle::from_bytes([0xAB; KEY_LEN]);
        assert_eq!(format!("{key:?}"), "KeyHandle(..)");
    }
}
