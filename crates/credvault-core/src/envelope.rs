//! Authenticated envelopes for single records.
//!
//! Uses XChaCha20-Poly1305 (192-bit nonce) under a per-envelope key expanded
//! from the active key with the envelope's own salt.
//! Key size: 32 bytes.  IV: 24 bytes (random).  Tag: 16 bytes.
//!
//! Stored form is JSON with base64 byte fields:
//!   { version, createdAt, salt, iv, ciphertext, tag }

use base64::engine::general_purpose;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};
use crate::kdf::{derive_key, generate_salt, subkey, KeyHandle, SALT_LEN};

pub const FORMAT_VERSION: u32 = 1;
pub const IV_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

const RECORD_KEY_INFO: &[u8] = b"credvault-record-key";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a stored envelope. A malformed envelope is reported as a
    /// decryption failure.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            debug!("malformed envelope: {e}");
            VaultError::Decryption
        })
    }
}

/// Encrypt `plaintext` under `key` with a fresh salt and IV.
pub fn encrypt(plaintext: &[u8], key: &KeyHandle) -> Result<Envelope> {
    let salt = generate_salt();
    seal_with_salt(plaintext, key, &salt)
}

/// Decrypt an envelope. Every failure collapses into `VaultError::Decryption`.
pub fn decrypt(envelope: &Envelope, key: &KeyHandle) -> Result<Zeroizing<Vec<u8>>> {
    if envelope.version != FORMAT_VERSION
        || envelope.salt.len() != SALT_LEN
        || envelope.iv.len() != IV_LEN
        || envelope.tag.len() != TAG_LEN
    {
        debug!(version = envelope.version, "envelope shape rejected");
        return Err(VaultError::Decryption);
    }
    let record_key = subkey(key, &envelope.salt, RECORD_KEY_INFO)?;
    let cipher = XChaCha20Poly1305::new_from_slice(&record_key[..]).map_err(|_| VaultError::Decryption)?;

    let mut combined = Vec::with_capacity(envelope.ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(&envelope.ciphertext);
    combined.extend_from_slice(&envelope.tag);

    let aad = associated_data(envelope.version);
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(&envelope.iv),
            Payload {
                msg: &combined,
                aad: &aad,
            },
        )
        .map_err(|_| VaultError::Decryption)?;
    Ok(Zeroizing::new(plaintext))
}

pub fn encrypt_json<T: Serialize + ?Sized>(value: &T, key: &KeyHandle) -> Result<Envelope> {
    let bytes = Zeroizing::new(serde_json::to_vec(value)?);
    encrypt(&bytes, key)
}

pub fn decrypt_json<T: DeserializeOwned>(envelope: &Envelope, key: &KeyHandle) -> Result<T> {
    let bytes = decrypt(envelope, key)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        debug!("decrypted payload did not deserialize: {e}");
        VaultError::Decryption
    })
}

/// Seal under a one-off key derived from `password` and the envelope salt.
pub fn encrypt_with_password(plaintext: &[u8], password: &str) -> Result<Envelope> {
    let salt = generate_salt();
    let key = derive_key(password, &salt)?;
    seal_with_salt(plaintext, &key, &salt)
}

pub fn decrypt_with_password(envelope: &Envelope, password: &str) -> Result<Zeroizing<Vec<u8>>> {
    let key = derive_key(password, &envelope.salt)?;
    decrypt(envelope, &key)
}

fn seal_with_salt(plaintext: &[u8], key: &KeyHandle, salt: &[u8; SALT_LEN]) -> Result<Envelope> {
    let record_key = subkey(key, salt, RECORD_KEY_INFO)?;
    let cipher = XChaCha20Poly1305::new_from_slice(&record_key[..]).map_err(|_| VaultError::KeyDerivation)?;

    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let aad = associated_data(FORMAT_VERSION);
    let mut sealed = cipher
        .encrypt(
            XNonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| {
            tracing::error!("aead encrypt failed: {e}");
            VaultError::KeyDerivation
        })?;
    // aead output is ciphertext || tag
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(Envelope {
        version: FORMAT_VERSION,
        created_at: Utc::now(),
        salt: salt.to_vec(),
        iv: iv.to_vec(),
        ciphertext: sealed,
        tag,
    })
}

fn associated_data(version: u32) -> Vec<u8> {
    format!("credvault-envelope/v{version}").into_bytes()
}

mod b64 {
    use super::general_purpose;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn json_roundtrip() {
        let key = KeyHandle::generate();
        let value = json!({"user": "root", "port": 22, "tags": ["prod", "db"]});
        let env = encrypt_json(&value, &key).unwrap();
        let back: serde_json::Value = decrypt_json(&env, &key).unwrap();
        assert_eq!(back, value);
        assert_eq!(env.version, FORMAT_VERSION);
        assert_eq!(env.tag.len(), TAG_LEN);
    }

    #[test]
    fn flipping_any_ciphertext_or_tag_bit_fails_closed() {
        let key = KeyHandle::generate();
        let env = encrypt(b"secret host password", &key).unwrap();
        for i in 0..env.ciphertext.len() {
            let mut t = env.clone();
            t.ciphertext[i] ^= 0x01;
            assert!(matches!(decrypt(&t, &key), Err(VaultError::Decryption)));
        }
        for i in 0..env.tag.len() {
            let mut t = env.clone();
            t.tag[i] ^= 0x80;
            assert!(matches!(decrypt(&t, &key), Err(VaultError::Decryption)));
        }
    }

    #[test]
    fn wrong_key_and_tamper_look_the_same() {
        let key = KeyHandle::generate();
        let env = encrypt(b"data", &key).unwrap();
        let wrong = decrypt(&env, &KeyHandle::generate()).unwrap_err();
        let mut t = env.clone();
        t.iv[0] ^= 1;
        let tampered = decrypt(&t, &key).unwrap_err();
        assert_eq!(wrong.to_string(), tampered.to_string());
    }

    #[test]
    fn version_bump_is_rejected() {
        let key = KeyHandle::generate();
        let mut env = encrypt(b"data", &key).unwrap();
        env.version = FORMAT_VERSION + 1;
        assert!(matches!(decrypt(&env, &key), Err(VaultError::Decryption)));
    }

    #[test]
    fn salt_and_iv_are_fresh_per_call() {
        let key = KeyHandle::generate();
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let env = encrypt(b"identical", &key).unwrap();
            assert!(seen.insert((env.salt.clone(), env.iv.clone())));
        }
    }

    #[test]
    fn stored_form_roundtrips_and_rejects_garbage() {
        let key = KeyHandle::generate();
        let env = encrypt(b"abc", &key).unwrap();
        let parsed = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, env);
        assert!(matches!(
            Envelope::from_bytes(b"{\"user\":\"root\"}"),
            Err(VaultError::Decryption)
        ));
    }

    #[test]
    fn password_envelopes_open_only_with_that_password() {
        let env = encrypt_with_password(b"legacy export", "Tr0ub4dor&3!xQ").unwrap();
        let out = decrypt_with_password(&env, "Tr0ub4dor&3!xQ").unwrap();
        assert_eq!(&out[..], b"legacy export");
        assert!(matches!(
            decrypt_with_password(&env, "not it"),
            Err(VaultError::Decryption)
        ));
    }

    #[test]
    fn undeserializable_payload_is_a_decryption_error() {
        let key = KeyHandle::generate();
        let env = encrypt(b"not json", &key).unwrap();
        let res: Result<serde_json::Value> = decrypt_json(&env, &key);
        assert!(matches!(res, Err(VaultError::Decryption)));
    }
}
