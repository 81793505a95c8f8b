//! Bulk re-encryption: migration of plaintext records and key rotation.
//!
//! Neither operation is atomic across the store. Each record is rewritten as
//! a single entry replacement and carries its own metadata, so a crash leaves
//! a mix of old and new entries that all remain readable by disposition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::KeyValueStore;
use crate::envelope;
use crate::error::{Result, VaultError};
use crate::kdf::KeyHandle;
use crate::record::{RecordStore, StoredRecord, RESERVED_PREFIX};

pub const DEFAULT_MAX_KEY_AGE_DAYS: i64 = 90;
pub const DEFAULT_WARNING_DAYS: i64 = 14;

const BOOKKEEPING_ENTRY: &str = "rotation";

pub fn bookkeeping_entry() -> String {
    format!("{RESERVED_PREFIX}{BOOKKEEPING_ENTRY}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationBookkeeping {
    pub last_key_rotation: DateTime<Utc>,
    pub key_rotation_required: bool,
}

impl RotationBookkeeping {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            last_key_rotation: now,
            key_rotation_required: false,
        }
    }

    pub async fn load(backend: &dyn KeyValueStore) -> Result<Option<Self>> {
        match backend.read(&bookkeeping_entry()).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, backend: &dyn KeyValueStore) -> Result<()> {
        backend
            .write(&bookkeeping_entry(), &serde_json::to_vec(self)?)
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_key_age: Duration,
    pub warning: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_key_age: Duration::days(DEFAULT_MAX_KEY_AGE_DAYS),
            warning: Duration::days(DEFAULT_WARNING_DAYS),
        }
    }
}

/// Advisory only; callers decide whether to force a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationStatus {
    pub needs_rotation: bool,
    pub warning: bool,
    pub days_until_needed: i64,
}

impl RotationPolicy {
    pub fn status(&self, bookkeeping: &RotationBookkeeping, now: DateTime<Utc>) -> RotationStatus {
        let age = now - bookkeeping.last_key_rotation;
        let left = self.max_key_age - age;
        let needs_rotation = bookkeeping.key_rotation_required || left <= Duration::zero();
        RotationStatus {
            needs_rotation,
            warning: !needs_rotation && left <= self.warning,
            days_until_needed: if needs_rotation { 0 } else { left.num_days() },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryFailure {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub migrated: Vec<String>,
    /// Plaintext entries that are not structured data and were left alone.
    pub skipped: Vec<String>,
    pub failures: Vec<EntryFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub rotated: Vec<String>,
    pub failures: Vec<EntryFailure>,
}

/// Exclusive hold on bulk re-encryption. The flag clears when the guard drops.
#[derive(Debug)]
pub struct RotationGuard(Arc<AtomicBool>);

impl RotationGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| VaultError::RotationInProgress)?;
        Ok(Self(flag.clone()))
    }
}

impl Drop for RotationGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone, Debug)]
pub struct RotationEngine {
    records: RecordStore,
    rotating: Arc<AtomicBool>,
}

impl RotationEngine {
    pub fn new(records: RecordStore) -> Self {
        Self {
            records,
            rotating: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Take the engine for a migration, a rotation, or a key install that
    /// must not interleave with either. `RotationInProgress` when held.
    pub fn begin(&self) -> Result<RotationGuard> {
        RotationGuard::acquire(&self.rotating)
    }

    /// Encrypt every plaintext record that holds JSON under the active key.
    pub async fn migrate(&self) -> Result<MigrationReport> {
        let guard = self.begin()?;
        self.migrate_with(&guard).await
    }

    pub(crate) async fn migrate_with(&self, guard: &RotationGuard) -> Result<MigrationReport> {
        debug_assert!(Arc::ptr_eq(&guard.0, &self.rotating));
        let key = self.records.session().require().await?;
        let mut report = MigrationReport::default();
        for name in self.records.keys().await? {
            match self.migrate_entry(&name, &key).await {
                Ok(Some(true)) => report.migrated.push(name),
                Ok(Some(false)) => report.skipped.push(name),
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %name, error = %e, "migration of entry failed; skipping");
                    report.failures.push(EntryFailure {
                        key: name,
                        reason: e.to_string(),
                    });
                }
            }
        }
        info!(
            migrated = report.migrated.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "plaintext migration finished"
        );
        Ok(report)
    }

    /// `Some(true)` migrated, `Some(false)` left as non-structured plaintext,
    /// `None` nothing to do.
    async fn migrate_entry(&self, name: &str, key: &KeyHandle) -> Result<Option<bool>> {
        let mut unstructured = false;
        let migrated = self
            .records
            .rewrite(name, |record| {
                let StoredRecord::Plain(bytes) = record else {
                    return Ok(None);
                };
                if serde_json::from_slice::<serde_json::Value>(&bytes).is_err() {
                    unstructured = true;
                    return Ok(None);
                }
                Ok(Some(StoredRecord::Encrypted(envelope::encrypt(&bytes, key)?)))
            })
            .await?;
        if unstructured {
            debug!(key = %name, "plaintext entry is not structured; leaving it unencrypted");
            return Ok(Some(false));
        }
        Ok(migrated.then_some(true))
    }

    /// Re-encrypt every encrypted record under `new_key`.
    pub async fn rotate(&self, new_key: KeyHandle) -> Result<RotationReport> {
        let guard = self.begin()?;
        self.rotate_with(&guard, new_key).await
    }

    /// `new_key` becomes the active key before any record is touched and the
    /// outgoing key joins the retired keys, so reads and writes stay
    /// consistent while entries move over. Retired keys are dropped once
    /// every entry has moved.
    ///
    /// Entries that fail are logged and left where they are; the rotation
    /// still completes for the rest.
    pub(crate) async fn rotate_with(&self, guard: &RotationGuard, new_key: KeyHandle) -> Result<RotationReport> {
        debug_assert!(Arc::ptr_eq(&guard.0, &self.rotating));
        let session = self.records.session();
        let mut retired = vec![session.require().await?];
        retired.extend(session.retired().await);
        session.install_with_retired(new_key.clone(), retired.clone()).await;

        let mut report = RotationReport::default();
        for name in self.records.keys().await? {
            match self.rotate_entry(&name, &retired, &new_key).await {
                Ok(true) => report.rotated.push(name),
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %name, error = %e, "re-encryption of entry failed; skipping");
                    report.failures.push(EntryFailure {
                        key: name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        RotationBookkeeping::fresh(Utc::now())
            .save(self.records.backend().as_ref())
            .await?;
        if report.failures.is_empty() {
            session.set_retired(Vec::new()).await;
        }
        info!(
            rotated = report.rotated.len(),
            failed = report.failures.len(),
            "key rotation finished"
        );
        Ok(report)
    }

    /// `Ok(false)` for plaintext entries and entries already under `new_key`.
    async fn rotate_entry(&self, name: &str, retired: &[KeyHandle], new_key: &KeyHandle) -> Result<bool> {
        self.records
            .rewrite(name, |record| {
                let StoredRecord::Encrypted(env) = record else {
                    return Ok(None);
                };
                if envelope::decrypt(&env, new_key).is_ok() {
                    return Ok(None);
                }
                for key in retired {
                    if let Ok(plaintext) = envelope::decrypt(&env, key) {
                        let resealed = envelope::encrypt(&plaintext, new_key)?;
                        return Ok(Some(StoredRecord::Encrypted(resealed)));
                    }
                }
                Err(VaultError::Decryption)
            })
            .await
    }
}
