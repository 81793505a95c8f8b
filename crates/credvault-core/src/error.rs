use thiserror::Error;

/// Every failure the credential store surfaces to its callers.
///
/// Primitive error text (aead, pbkdf2, argon2, backend I/O) is logged where it
/// happens and never carried across this boundary verbatim for crypto paths.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("No active key; enter the master password first")]
    MissingKey,

    #[error("Unable to decrypt record")]
    Decryption,

    #[error("Too many failed attempts; try again in {remaining_minutes} minute(s)")]
    Lockout { remaining_minutes: u32 },

    #[error("Master password is too weak: {}", .0.join("; "))]
    WeakPassword(Vec<String>),

    #[error("Master password has not been set")]
    PasswordNotSet,

    #[error("Password does not match this vault")]
    PasswordMismatch,

    #[error("A key rotation or migration is already running")]
    RotationInProgress,

    #[error("Invalid record key: {0}")]
    InvalidKey(String),

    #[error("Invalid settings: {0}")]
    Settings(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VaultError>;

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        VaultError::Backend(err.to_string())
    }
}
