//! Master password manager.
//!
//! Owns the key session and everything that replaces the active key:
//! first-time setup, session unlock, password change and key rotation.
//! Password attempts run one at a time and each passes the lockout gate
//! before any hashing. Operations that install or replace the active key
//! hold the rotation engine for their whole run.
//!
//! Persisted per installation (reserved entries in the record backend):
//! - `__credvault.keyparams`: KDF salt, iteration count, key-check envelope,
//!   and the retired keys of an unfinished rotation sealed under the new key
//! - `__credvault.rotation`: rotation bookkeeping
//!
//! Per session (session store, cleared with the session):
//! - `verifier`: Argon2id PHC string of the master password

use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::backend::{KeyValueStore, MemoryStore};
use crate::envelope::{self, Envelope};
use crate::error::{Result, VaultError};
use crate::kdf::{derive_key_with_iterations, generate_salt, KeyHandle, KEY_LEN};
use crate::lockout::{AttemptLog, LockoutPolicy, LockoutStatus};
use crate::notify::{NoticeKind, Notifier, TracingNotifier};
use crate::record::{RecordMeta, RecordStore, RESERVED_PREFIX};
use crate::rotation::{
    MigrationReport, RotationBookkeeping, RotationEngine, RotationGuard, RotationReport, RotationStatus,
};
use crate::session::KeySession;
use crate::settings::VaultSettings;
use crate::strength;

const KEY_PARAMS_ENTRY: &str = "keyparams";
const VERIFIER_ENTRY: &str = "verifier";
const KEY_CHECK_SENTINEL: &[u8] = b"credvault-key-check";

fn key_params_entry() -> String {
    format!("{RESERVED_PREFIX}{KEY_PARAMS_ENTRY}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyParams {
    salt: String,
    kdf_iterations: u32,
    check: Envelope,
    /// Keys records may still be sealed under, each sealed under this key.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    retired: Vec<Envelope>,
    created_at: DateTime<Utc>,
}

impl KeyParams {
    /// Derive a key from `password`, seal a fresh key-check under it and
    /// carry `retired` along.
    fn create(password: &str, iterations: u32, retired: &[KeyHandle]) -> Result<(Self, KeyHandle)> {
        let salt = generate_salt();
        let key = derive_key_with_iterations(password, &salt, iterations)?;
        let retired = retired
            .iter()
            .map(|old| envelope::encrypt(old.as_bytes(), &key))
            .collect::<Result<Vec<_>>>()?;
        let params = Self {
            salt: B64.encode(salt),
            kdf_iterations: iterations,
            check: envelope::encrypt(KEY_CHECK_SENTINEL, &key)?,
            retired,
            created_at: Utc::now(),
        };
        Ok((params, key))
    }

    /// Derive with the stored salt; `None` when the key-check does not open.
    fn open(&self, password: &str) -> Result<Option<KeyHandle>> {
        let salt = B64.decode(&self.salt).map_err(|e| {
            error!("stored key salt is not base64: {e}");
            VaultError::KeyDerivation
        })?;
        let key = derive_key_with_iterations(password, &salt, self.kdf_iterations)?;
        match envelope::decrypt(&self.check, &key) {
            Ok(sentinel) if &sentinel[..] == KEY_CHECK_SENTINEL => Ok(Some(key)),
            _ => Ok(None),
        }
    }

    /// Retired keys that open under `key`. Ones that do not are skipped.
    fn retired_keys(&self, key: &KeyHandle) -> Vec<KeyHandle> {
        let mut keys = Vec::with_capacity(self.retired.len());
        for sealed in &self.retired {
            let opened = envelope::decrypt(sealed, key)
                .ok()
                .and_then(|bytes| <[u8; KEY_LEN]>::try_from(&bytes[..]).ok());
            match opened {
                Some(bytes) => keys.push(KeyHandle::from_bytes(bytes)),
                None => warn!("retired key does not open under the current key; skipping it"),
            }
        }
        keys
    }

    async fn load(backend: &dyn KeyValueStore) -> Result<Option<Self>> {
        match backend.read(&key_params_entry()).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, backend: &dyn KeyValueStore) -> Result<()> {
        backend.write(&key_params_entry(), &serde_json::to_vec(self)?).await
    }
}

/// Key parameters together with the key they opened.
struct Opened {
    params: KeyParams,
    key: KeyHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ManagerState {
    /// No master password was ever set; records are stored in plaintext.
    Uninitialized,
    /// A master password exists but this session holds no key.
    PasswordSet,
    /// Too many recent failures; attempts are refused until the window passes.
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified { rotation: RotationStatus },
    Rejected { remaining_attempts: u32 },
}

pub struct MasterPasswordManager {
    backend: Arc<dyn KeyValueStore>,
    session_store: Arc<dyn KeyValueStore>,
    session: KeySession,
    records: RecordStore,
    engine: RotationEngine,
    attempts: Mutex<AttemptLog>,
    /// Held from the lockout gate until the attempt is recorded.
    attempt_turn: tokio::sync::Mutex<()>,
    settings: VaultSettings,
    notifier: Arc<dyn Notifier>,
}

impl MasterPasswordManager {
    /// Manager over `backend` with an in-memory session store and notices
    /// routed to tracing.
    pub fn new(backend: Arc<dyn KeyValueStore>, settings: VaultSettings) -> Self {
        let session = KeySession::new();
        let records = RecordStore::new(backend.clone(), session.clone());
        let engine = RotationEngine::new(records.clone());
        Self {
            backend,
            session_store: Arc::new(MemoryStore::new()),
            session,
            records,
            engine,
            attempts: Mutex::new(AttemptLog::new()),
            attempt_turn: tokio::sync::Mutex::new(()),
            settings,
            notifier: Arc::new(TracingNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_session_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.session_store = store;
        self
    }

    pub fn session(&self) -> &KeySession {
        &self.session
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Direct access to the engine, for callers that manage their own keys.
    pub fn engine(&self) -> &RotationEngine {
        &self.engine
    }

    pub fn settings(&self) -> &VaultSettings {
        &self.settings
    }

    pub async fn state(&self) -> Result<ManagerState> {
        if self.session.is_active().await {
            return Ok(ManagerState::Unlocked);
        }
        if KeyParams::load(self.backend.as_ref()).await?.is_none() {
            return Ok(ManagerState::Uninitialized);
        }
        if !self.check_lockout_status().allowed {
            return Ok(ManagerState::Locked);
        }
        Ok(ManagerState::PasswordSet)
    }

    /// Set up the master password and encrypt existing structured records.
    ///
    /// On an installation that already has a password the same password must
    /// be supplied; use [`Self::change_master_password`] to replace it.
    pub async fn set_master_password(&self, password: &str) -> Result<MigrationReport> {
        self.require_strong(password)?;
        let guard = self.engine.begin()?;

        if KeyParams::load(self.backend.as_ref()).await?.is_some() {
            let opened = self.authenticate(password).await?;
            self.open_session(opened).await;
        } else {
            let (params, key) = KeyParams::create(password, self.settings.kdf.iterations, &[])?;
            params.save(self.backend.as_ref()).await?;
            if RotationBookkeeping::load(self.backend.as_ref()).await?.is_none() {
                RotationBookkeeping::fresh(Utc::now())
                    .save(self.backend.as_ref())
                    .await?;
            }
            info!("master password initialised");
            self.session.install_with_retired(key, Vec::new()).await;
        }

        self.store_verifier(password).await?;
        let report = self.engine.migrate_with(&guard).await?;
        if !report.failures.is_empty() {
            self.notifier.notify(
                NoticeKind::Warning,
                &format!("{} record(s) could not be encrypted", report.failures.len()),
            );
        }
        Ok(report)
    }

    /// Check `password` against this session's verifier.
    ///
    /// Returns `Err(Lockout)` without hashing while locked out. The attempt is
    /// recorded once its outcome is known.
    pub async fn verify_master_password(&self, password: &str) -> Result<VerifyOutcome> {
        let (ok, status) = {
            let _turn = self.attempt_turn.lock().await;
            self.lockout_gate()?;
            let Some(raw) = self.session_store.read(VERIFIER_ENTRY).await? else {
                return Err(VaultError::PasswordNotSet);
            };
            let phc = String::from_utf8(raw).map_err(|_| VaultError::PasswordNotSet)?;
            let ok = verifier_matches(&phc, password);
            (ok, self.record_attempt(ok))
        };

        if !ok {
            self.announce_failure(&status);
            return Ok(VerifyOutcome::Rejected {
                remaining_attempts: status.remaining_attempts,
            });
        }
        let rotation = self.check_rotation_status().await?;
        self.announce_rotation(&rotation);
        Ok(VerifyOutcome::Verified { rotation })
    }

    /// Open a session on an existing installation.
    pub async fn unlock(&self, password: &str) -> Result<RotationStatus> {
        let _guard = self.engine.begin()?;
        let opened = self.authenticate(password).await?;
        self.open_session(opened).await;
        self.store_verifier(password).await?;
        info!("vault unlocked");
        let rotation = self.check_rotation_status().await?;
        self.announce_rotation(&rotation);
        Ok(rotation)
    }

    /// Drop the active key and the session verifier.
    pub async fn clear_master_password(&self) -> Result<()> {
        self.session.clear().await;
        self.session_store.delete(VERIFIER_ENTRY).await?;
        info!("session key cleared");
        Ok(())
    }

    /// Re-encrypt every record under a key derived from `new`.
    pub async fn change_master_password(&self, current: &str, new: &str) -> Result<RotationReport> {
        let guard = self.engine.begin()?;
        let opened = self.authenticate(current).await?;
        self.require_strong(new)?;
        let report = self.rekey(&guard, opened, new).await?;
        self.notifier
            .notify(NoticeKind::Info, "Master password changed");
        Ok(report)
    }

    /// Rotate onto a fresh key derived from the same password and a new salt.
    pub async fn rotate_master_key(&self, password: &str) -> Result<RotationReport> {
        let guard = self.engine.begin()?;
        let opened = self.authenticate(password).await?;
        let report = self.rekey(&guard, opened, password).await?;
        self.notifier.notify(NoticeKind::Info, "Master key rotated");
        Ok(report)
    }

    pub fn check_lockout_status(&self) -> LockoutStatus {
        self.attempts.lock().status(&self.lockout_policy(), Utc::now())
    }

    /// Evaluate the rotation policy, persisting the required flag once the
    /// key is overdue.
    pub async fn check_rotation_status(&self) -> Result<RotationStatus> {
        let now = Utc::now();
        let policy = self.settings.rotation_policy();
        let Some(mut book) = RotationBookkeeping::load(self.backend.as_ref()).await? else {
            return Ok(policy.status(&RotationBookkeeping::fresh(now), now));
        };
        let status = policy.status(&book, now);
        if status.needs_rotation && !book.key_rotation_required {
            book.key_rotation_required = true;
            book.save(self.backend.as_ref()).await?;
            debug!("key rotation flagged as required");
        }
        Ok(status)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        self.records.get(key).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.records.get_json(key).await
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.records.set(key, value).await
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.records.set_json(key, value).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.records.remove(key).await
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.records.keys().await
    }

    pub async fn metadata(&self, key: &str) -> Result<Option<RecordMeta>> {
        self.records.metadata(key).await
    }

    /// Encrypt remaining plaintext records under the active key.
    /// `RotationInProgress` while a rotation or password change runs.
    pub async fn migrate(&self) -> Result<MigrationReport> {
        self.engine.migrate().await
    }

    fn lockout_policy(&self) -> LockoutPolicy {
        self.settings.lockout_policy()
    }

    fn lockout_gate(&self) -> Result<()> {
        let status = self.check_lockout_status();
        if status.allowed {
            return Ok(());
        }
        let remaining_minutes = status.lockout_minutes.unwrap_or(1);
        warn!(remaining_minutes, "password attempt refused during lockout");
        self.notifier.notify(
            NoticeKind::Warning,
            &format!("Too many failed attempts; locked for {remaining_minutes} minute(s)"),
        );
        Err(VaultError::Lockout { remaining_minutes })
    }

    fn record_attempt(&self, success: bool) -> LockoutStatus {
        let now = Utc::now();
        let mut log = self.attempts.lock();
        log.record(success, now);
        log.status(&self.lockout_policy(), now)
    }

    fn announce_failure(&self, status: &LockoutStatus) {
        warn!(remaining = status.remaining_attempts, "master password rejected");
        let message = match status.lockout_minutes {
            Some(minutes) => format!("Incorrect password; locked for {minutes} minute(s)"),
            None => format!(
                "Incorrect password; {} attempt(s) remaining",
                status.remaining_attempts
            ),
        };
        self.notifier.notify(NoticeKind::Warning, &message);
    }

    fn announce_rotation(&self, status: &RotationStatus) {
        if status.needs_rotation {
            self.notifier
                .notify(NoticeKind::Warning, "Master key rotation is required");
        } else if status.warning {
            self.notifier.notify(
                NoticeKind::Warning,
                &format!(
                    "Master key rotation due in {} day(s)",
                    status.days_until_needed
                ),
            );
        }
    }

    fn require_strong(&self, password: &str) -> Result<()> {
        let report = strength::assess(password, &self.settings.password_policy);
        if report.is_acceptable() {
            return Ok(());
        }
        debug!(score = report.score, "password rejected by strength policy");
        Err(VaultError::WeakPassword(report.problems))
    }

    /// Lockout-gated check of `password` against the stored key parameters.
    async fn authenticate(&self, password: &str) -> Result<Opened> {
        let _turn = self.attempt_turn.lock().await;
        self.lockout_gate()?;
        let params = KeyParams::load(self.backend.as_ref())
            .await?
            .ok_or(VaultError::PasswordNotSet)?;
        let key = params.open(password)?;
        let status = self.record_attempt(key.is_some());
        match key {
            Some(key) => Ok(Opened { params, key }),
            None => {
                self.announce_failure(&status);
                Err(VaultError::PasswordMismatch)
            }
        }
    }

    /// Install the opened key along with any keys an unfinished rotation
    /// left behind.
    async fn open_session(&self, opened: Opened) {
        let retired = opened.params.retired_keys(&opened.key);
        if !retired.is_empty() {
            self.notifier.notify(
                NoticeKind::Warning,
                "An earlier key rotation did not finish; rotate the master key to complete it",
            );
        }
        self.session.install_with_retired(opened.key, retired).await;
    }

    /// Move every record onto a key derived from `password` with a new salt.
    ///
    /// The new parameters are written first and carry the outgoing keys, so
    /// a vault interrupted at any point still opens with `password` and
    /// reads every record. The outgoing keys are dropped from the parameters
    /// once every record has moved.
    async fn rekey(&self, guard: &RotationGuard, opened: Opened, password: &str) -> Result<RotationReport> {
        let retired = opened.params.retired_keys(&opened.key);
        let mut outgoing = Vec::with_capacity(retired.len() + 1);
        outgoing.push(opened.key.clone());
        outgoing.extend(retired.iter().cloned());

        let (mut params, new_key) = KeyParams::create(password, self.settings.kdf.iterations, &outgoing)?;
        params.save(self.backend.as_ref()).await?;
        self.session.install_with_retired(opened.key, retired).await;

        let report = self.engine.rotate_with(guard, new_key).await?;
        if report.failures.is_empty() {
            params.retired.clear();
            params.save(self.backend.as_ref()).await?;
        } else {
            self.notifier.notify(
                NoticeKind::Warning,
                &format!(
                    "{} record(s) were not re-encrypted; the outgoing key is kept to read them",
                    report.failures.len()
                ),
            );
        }
        self.store_verifier(password).await?;
        Ok(report)
    }

    async fn store_verifier(&self, password: &str) -> Result<()> {
        let phc = hash_verifier(password)?;
        self.session_store
            .write(VERIFIER_ENTRY, phc.as_bytes())
            .await
    }
}

impl std::fmt::Debug for MasterPasswordManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterPasswordManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn hash_verifier(password: &str) -> Result<String> {
    let salt = SaltString::encode_b64(&generate_salt()).map_err(|e| {
        error!("argon2 salt encoding failed: {e}");
        VaultError::KeyDerivation
    })?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| {
            error!("argon2 hash failed: {e}");
            VaultError::KeyDerivation
        })
}

fn verifier_matches(phc: &str, password: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!("stored verifier is unreadable: {e}");
            false
        }
    }
}
