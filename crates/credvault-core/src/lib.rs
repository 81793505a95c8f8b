//! credvault-core: encrypted local credential store.
//!
//! # Encryption strategy
//! - The active key is derived from the master password with PBKDF2-HMAC-SHA256
//!   and a per-installation salt, and is held in memory only for the session.
//! - Every record is sealed in its own XChaCha20-Poly1305 envelope under a key
//!   expanded from the active key with the envelope's salt.
//! - Records written before a master password exists stay plaintext until
//!   migration; each record's metadata says which form it is in.
//!
//! # Sessions
//! `MasterPasswordManager` owns the `KeySession`. Password attempts are
//! throttled by a sliding-window lockout, and the rotation policy is checked
//! whenever a session is opened.

pub mod backend;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod lockout;
pub mod manager;
pub mod notify;
pub mod paths;
pub mod record;
pub mod rotation;
pub mod session;
pub mod settings;
pub mod strength;

pub use backend::{FileStore, KeyValueStore, MemoryStore};
pub use envelope::Envelope;
pub use error::{Result, VaultError};
pub use kdf::KeyHandle;
pub use lockout::LockoutStatus;
pub use manager::{ManagerState, MasterPasswordManager, VerifyOutcome};
pub use notify::{NoticeKind, Notifier, NullNotifier, TracingNotifier};
pub use record::{RecordMeta, RecordStore};
pub use rotation::{EntryFailure, MigrationReport, RotationEngine, RotationGuard, RotationReport, RotationStatus};
pub use session::KeySession;
pub use settings::VaultSettings;
