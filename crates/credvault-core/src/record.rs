//! Record store: logical keys mapped onto the backing key-value service.
//!
//! Layout per logical key `K`:
//! - `K`: envelope JSON, or the raw value for unencrypted records
//! - `K#meta`: `RecordMeta`
//!
//! Entries with no metadata are legacy plaintext and are returned as stored.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::backend::KeyValueStore;
use crate::envelope::{self, Envelope};
use crate::error::{Result, VaultError};
use crate::session::KeySession;

pub const META_SUFFIX: &str = "#meta";
/// Prefix of global entries (bookkeeping, key parameters). Never a record.
pub const RESERVED_PREFIX: &str = "__credvault.";

/// Format version recorded for plaintext entries.
pub const PLAIN_FORMAT_VERSION: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    pub key: String,
    pub encrypted: bool,
    pub format_version: u32,
}

impl RecordMeta {
    fn plain(key: &str) -> Self {
        Self {
            key: key.to_string(),
            encrypted: false,
            format_version: PLAIN_FORMAT_VERSION,
        }
    }

    fn encrypted(key: &str, format_version: u32) -> Self {
        Self {
            key: key.to_string(),
            encrypted: true,
            format_version,
        }
    }
}

/// A value and its metadata, read as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredRecord {
    Plain(Vec<u8>),
    Encrypted(Envelope),
}

#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn KeyValueStore>,
    session: KeySession,
    /// One mutation at a time across all clones.
    writes: Arc<Mutex<()>>,
}

impl RecordStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, session: KeySession) -> Self {
        Self {
            backend,
            session,
            writes: Arc::new(Mutex::new(())),
        }
    }

    pub fn session(&self) -> &KeySession {
        &self.session
    }

    pub(crate) fn backend(&self) -> &Arc<dyn KeyValueStore> {
        &self.backend
    }

    /// Plaintext bytes for `key`.
    ///
    /// Encrypted records need an active key (`MissingKey` otherwise). A record
    /// that fails to decrypt is logged and reported as absent.
    pub async fn get(&self, key: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        validate_key(key)?;
        let record = match self.load(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(VaultError::Decryption) => {
                warn!(key = %key, "stored envelope is malformed; treating record as absent");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match record {
            StoredRecord::Plain(bytes) => Ok(Some(Zeroizing::new(bytes))),
            StoredRecord::Encrypted(env) => {
                let active = self.session.require().await?;
                match envelope::decrypt(&env, &active) {
                    Ok(plain) => Ok(Some(plain)),
                    Err(VaultError::Decryption) => {
                        for retired in self.session.retired().await {
                            if let Ok(plain) = envelope::decrypt(&env, &retired) {
                                debug!(key = %key, "record is still sealed under a retired key");
                                return Ok(Some(plain));
                            }
                        }
                        warn!(key = %key, "record failed to decrypt; treating as absent");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// `get` followed by JSON deserialization of the plaintext.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write `value`. Encrypted when a key is active at write time, plaintext
    /// otherwise.
    ///
    /// The session stays pinned until the record is stored, so a key swap
    /// never lands between sealing and writing.
    pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        let _turn = self.writes.lock().await;
        let pinned = self.session.pin().await;
        let record = match pinned.active() {
            Some(active) => StoredRecord::Encrypted(envelope::encrypt(value, active)?),
            None => {
                debug!(key = %key, "no active key; writing record unencrypted");
                StoredRecord::Plain(value.to_vec())
            }
        };
        let stored = self.store(key, &record).await;
        drop(pinned);
        stored
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = Zeroizing::new(serde_json::to_vec(value)?);
        self.set(key, &bytes).await
    }

    /// Delete the value and its metadata. Removing a missing key is a no-op.
    pub async fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let _turn = self.writes.lock().await;
        self.backend.delete(key).await?;
        self.backend.delete(&meta_key(key)).await
    }

    pub async fn metadata(&self, key: &str) -> Result<Option<RecordMeta>> {
        validate_key(key)?;
        match self.backend.read(&meta_key(key)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Logical keys that carry metadata, in ascending order.
    pub async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .backend
            .list()
            .await?
            .into_iter()
            .filter_map(|name| name.strip_suffix(META_SUFFIX).map(str::to_string))
            .filter(|name| !name.starts_with(RESERVED_PREFIX))
            .collect())
    }

    /// Value and metadata as one unit. Unreadable metadata or a malformed
    /// envelope is reported as `Decryption`.
    async fn load(&self, key: &str) -> Result<Option<StoredRecord>> {
        let meta = match self.backend.read(&meta_key(key)).await? {
            Some(raw) => Some(serde_json::from_slice::<RecordMeta>(&raw).map_err(|e| {
                warn!(key = %key, "record metadata is unreadable: {e}");
                VaultError::Decryption
            })?),
            None => None,
        };
        let Some(value) = self.backend.read(key).await? else {
            if meta.is_some() {
                debug!(key = %key, "metadata without value");
            }
            return Ok(None);
        };
        match meta {
            Some(meta) if meta.encrypted => Ok(Some(StoredRecord::Encrypted(Envelope::from_bytes(&value)?))),
            _ => Ok(Some(StoredRecord::Plain(value))),
        }
    }

    /// Read, transform and write back `key` without another mutation landing
    /// in between. `change` returns the replacement, or `None` to leave the
    /// entry as it is. `Ok(true)` when something was written.
    pub(crate) async fn rewrite<F>(&self, key: &str, change: F) -> Result<bool>
    where
        F: FnOnce(StoredRecord) -> Result<Option<StoredRecord>>,
    {
        let _turn = self.writes.lock().await;
        let Some(current) = self.load(key).await? else {
            return Ok(false);
        };
        match change(current)? {
            Some(next) => {
                self.store(key, &next).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Write value then metadata. Each write replaces a single entry.
    async fn store(&self, key: &str, record: &StoredRecord) -> Result<()> {
        let (value, meta) = match record {
            StoredRecord::Plain(bytes) => (bytes.clone(), RecordMeta::plain(key)),
            StoredRecord::Encrypted(env) => (env.to_bytes()?, RecordMeta::encrypted(key, env.version)),
        };
        self.backend.write(key, &value).await?;
        self.backend
            .write(&meta_key(key), &serde_json::to_vec(&meta)?)
            .await
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").finish_non_exhaustive()
    }
}

pub fn meta_key(key: &str) -> String {
    format!("{key}{META_SUFFIX}")
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.ends_with(META_SUFFIX) || key.starts_with(RESERVED_PREFIX) {
        return Err(VaultError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::kdf::KeyHandle;
    use serde_json::json;

    fn fixture() -> (Arc<MemoryStore>, RecordStore) {
        let backend = Arc::new(MemoryStore::new());
        let store = RecordStore::new(backend.clone(), KeySession::new());
        (backend, store)
    }

    #[tokio::test]
    async fn writes_plaintext_without_a_key() {
        let (backend, store) = fixture();
        store.set_json("host1", &json!({"user": "root"})).await.unwrap();
        let meta = store.metadata("host1").await.unwrap().unwrap();
        assert!(!meta.encrypted);
        assert_eq!(
            backend.read("host1").await.unwrap().unwrap(),
            br#"{"user":"root"}"#.to_vec()
        );
    }

    #[tokio::test]
    async fn encrypts_when_a_key_is_active() {
        let (backend, store) = fixture();
        store.session().install(KeyHandle::generate()).await;
        store.set_json("host1", &json!({"user": "root"})).await.unwrap();

        let raw = backend.read("host1").await.unwrap().unwrap();
        assert!(Envelope::from_bytes(&raw).is_ok());
        assert!(store.metadata("host1").await.unwrap().unwrap().encrypted);
        let back: serde_json::Value = store.get_json("host1").await.unwrap().unwrap();
        assert_eq!(back, json!({"user": "root"}));
    }

    #[tokio::test]
    async fn legacy_entries_without_metadata_are_returned_unchanged() {
        let (backend, store) = fixture();
        backend.write("legacy", b"not even json").await.unwrap();
        let got = store.get("legacy").await.unwrap().unwrap();
        assert_eq!(&got[..], b"not even json");
    }

    #[tokio::test]
    async fn encrypted_read_without_key_is_missing_key() {
        let (_, store) = fixture();
        store.session().install(KeyHandle::generate()).await;
        store.set("k", b"v").await.unwrap();
        store.session().clear().await;
        assert!(matches!(store.get("k").await, Err(VaultError::MissingKey)));
    }

    #[tokio::test]
    async fn wrong_key_or_corruption_yields_none() {
        let (backend, store) = fixture();
        store.session().install(KeyHandle::generate()).await;
        store.set("k", b"v").await.unwrap();
        store.set("broken", b"v").await.unwrap();
        backend.write("broken", b"garbage").await.unwrap();

        assert!(store.get("broken").await.unwrap().is_none());
        store.session().install(KeyHandle::generate()).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupted_metadata_yields_none() {
        let (backend, store) = fixture();
        store.session().install(KeyHandle::generate()).await;
        store.set("k", b"v").await.unwrap();
        backend.write("k#meta", b"{not json").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retired_key_still_opens_unrotated_records() {
        let (_, store) = fixture();
        let old = KeyHandle::generate();
        store.session().install(old.clone()).await;
        store.set("k", b"v").await.unwrap();

        store.session().install(KeyHandle::generate()).await;
        assert!(store.get("k").await.unwrap().is_none());
        store.session().set_retired(vec![old]).await;
        assert_eq!(&store.get("k").await.unwrap().unwrap()[..], b"v");
    }

    #[tokio::test]
    async fn rewrite_replaces_or_leaves_entries() {
        let (backend, store) = fixture();
        store.set("k", b"{}").await.unwrap();
        let before = backend.read("k#meta").await.unwrap();

        assert!(!store.rewrite("k", |_| Ok(None)).await.unwrap());
        assert!(!store.rewrite("absent", |_| panic!("no entry to change")).await.unwrap());
        assert_eq!(backend.read("k#meta").await.unwrap(), before);

        let key = KeyHandle::generate();
        let sealed = store
            .rewrite("k", |record| match record {
                StoredRecord::Plain(bytes) => Ok(Some(StoredRecord::Encrypted(envelope::encrypt(&bytes, &key)?))),
                StoredRecord::Encrypted(_) => Ok(None),
            })
            .await
            .unwrap();
        assert!(sealed);
        assert!(store.metadata("k").await.unwrap().unwrap().encrypted);
        store.session().install(key).await;
        assert_eq!(&store.get("k").await.unwrap().unwrap()[..], b"{}");
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_drops_metadata() {
        let (backend, store) = fixture();
        store.set("k", b"v").await.unwrap();
        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
        assert!(backend.list().await.unwrap().is_empty());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn keys_lists_records_only() {
        let (backend, store) = fixture();
        store.set("b", b"2").await.unwrap();
        store.set("a", b"1").await.unwrap();
        backend.write("__credvault.rotation", b"{}").await.unwrap();
        backend.write("loose", b"no meta").await.unwrap();
        assert_eq!(store.keys().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn reserved_and_meta_keys_are_rejected() {
        let (_, store) = fixture();
        for bad in ["", "x#meta", "__credvault.keyparams"] {
            assert!(matches!(store.set(bad, b"v").await, Err(VaultError::InvalidKey(_))));
        }
    }
}
