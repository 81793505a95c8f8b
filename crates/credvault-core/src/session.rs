//! Active key session.
//!
//! Holds the single key currently authorized to encrypt records, plus the
//! retired keys that records may still be sealed under after an unfinished
//! rotation. Clones share the same slots; only the password manager and the
//! rotation engine replace or clear them.
//!
//! Readers take a clone of the handle and drop the lock before doing any
//! cryptographic work. Writers pin the slots until their record is stored, so
//! a key swap waits for every write that captured the outgoing key.

use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};

use crate::error::{Result, VaultError};
use crate::kdf::KeyHandle;

#[derive(Default)]
struct Slots {
    active: Option<KeyHandle>,
    /// Newest first.
    retired: Vec<KeyHandle>,
}

#[derive(Clone, Default)]
pub struct KeySession {
    inner: Arc<RwLock<Slots>>,
}

/// Read access held for the duration of a write.
pub(crate) struct PinnedKey<'a>(RwLockReadGuard<'a, Slots>);

impl PinnedKey<'_> {
    pub(crate) fn active(&self) -> Option<&KeyHandle> {
        self.0.active.as_ref()
    }
}

impl KeySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active key. Retired keys are left as they are.
    #[cfg(test)]
    pub(crate) async fn install(&self, key: KeyHandle) {
        self.inner.write().await.active = Some(key);
    }

    /// Replace the active key and the retired list in one step.
    pub(crate) async fn install_with_retired(&self, key: KeyHandle, retired: Vec<KeyHandle>) {
        let mut slots = self.inner.write().await;
        slots.active = Some(key);
        slots.retired = retired;
    }

    pub(crate) async fn set_retired(&self, retired: Vec<KeyHandle>) {
        self.inner.write().await.retired = retired;
    }

    pub(crate) async fn clear(&self) {
        let mut slots = self.inner.write().await;
        slots.active = None;
        slots.retired.clear();
    }

    pub(crate) async fn pin(&self) -> PinnedKey<'_> {
        PinnedKey(self.inner.read().await)
    }

    pub async fn is_active(&self) -> bool {
        self.inner.read().await.active.is_some()
    }

    pub async fn current(&self) -> Option<KeyHandle> {
        self.inner.read().await.active.clone()
    }

    /// Keys of an unfinished rotation, tried when the active key fails.
    pub async fn retired(&self) -> Vec<KeyHandle> {
        self.inner.read().await.retired.clone()
    }

    /// The active key, or `MissingKey` when no session is open.
    pub async fn require(&self) -> Result<KeyHandle> {
        self.current().await.ok_or(VaultError::MissingKey)
    }
}

impl std::fmt::Debug for KeySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySession").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope;
    use std::time::Duration;

    #[tokio::test]
    async fn empty_session_reports_missing_key() {
        let session = KeySession::new();
        assert!(!session.is_active().await);
        assert!(matches!(session.require().await, Err(VaultError::MissingKey)));
    }

    #[tokio::test]
    async fn clones_share_the_slot() {
        let session = KeySession::new();
        let other = session.clone();
        session
            .install_with_retired(KeyHandle::generate(), vec![KeyHandle::generate()])
            .await;
        assert!(other.is_active().await);
        assert_eq!(other.retired().await.len(), 1);
        other.clear().await;
        assert!(!session.is_active().await);
        assert!(session.retired().await.is_empty());
    }

    #[tokio::test]
    async fn captured_handle_outlives_replacement() {
        let session = KeySession::new();
        let old = KeyHandle::generate();
        session.install(old).await;
        let captured = session.require().await.unwrap();
        let env = envelope::encrypt(b"in flight", &captured).unwrap();

        session.install(KeyHandle::generate()).await;
        let out = envelope::decrypt(&env, &captured).unwrap();
        assert_eq!(&out[..], b"in flight");
        let current = session.require().await.unwrap();
        assert!(envelope::decrypt(&env, &current).is_err());
    }

    #[tokio::test]
    async fn key_swap_waits_for_pinned_writers() {
        let session = KeySession::new();
        session.install(KeyHandle::generate()).await;
        let pinned = session.pin().await;
        assert!(pinned.active().is_some());

        let swapper = session.clone();
        let swap = tokio::spawn(async move { swapper.install(KeyHandle::generate()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!swap.is_finished());
        drop(pinned);
        swap.await.unwrap();
    }
}
