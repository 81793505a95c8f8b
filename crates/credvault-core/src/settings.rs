use std::fs;
use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::kdf::MIN_KDF_ITERATIONS;
use crate::lockout::{LockoutPolicy, DEFAULT_MAX_FAILED_ATTEMPTS, DEFAULT_WINDOW_MINUTES};
use crate::rotation::{RotationPolicy, DEFAULT_MAX_KEY_AGE_DAYS, DEFAULT_WARNING_DAYS};
use crate::strength::PasswordPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KdfSettings {
    pub iterations: u32,
}

impl Default for KdfSettings {
    fn default() -> Self {
        Self {
            iterations: MIN_KDF_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LockoutSettings {
    pub max_failed_attempts: u32,
    pub window_minutes: i64,
}

impl Default for LockoutSettings {
    fn default() -> Self {
        Self {
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            window_minutes: DEFAULT_WINDOW_MINUTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RotationSettings {
    pub max_key_age_days: i64,
    pub warning_days: i64,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            max_key_age_days: DEFAULT_MAX_KEY_AGE_DAYS,
            warning_days: DEFAULT_WARNING_DAYS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VaultSettings {
    pub kdf: KdfSettings,
    pub lockout: LockoutSettings,
    pub rotation: RotationSettings,
    pub password_policy: PasswordPolicy,
}

impl VaultSettings {
    /// Load from a JSON file; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read(path)?;
        let settings: Self = serde_json::from_slice(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kdf.iterations < MIN_KDF_ITERATIONS {
            return Err(VaultError::Settings(format!(
                "kdf.iterations {} is below the minimum {MIN_KDF_ITERATIONS}",
                self.kdf.iterations
            )));
        }
        if self.lockout.max_failed_attempts == 0 || self.lockout.window_minutes <= 0 {
            return Err(VaultError::Settings(
                "lockout needs at least one attempt and a positive window".into(),
            ));
        }
        if self.rotation.max_key_age_days <= 0
            || self.rotation.warning_days < 0
            || self.rotation.warning_days >= self.rotation.max_key_age_days
        {
            return Err(VaultError::Settings(
                "rotation.warningDays must be within rotation.maxKeyAgeDays".into(),
            ));
        }
        Ok(())
    }

    pub fn lockout_policy(&self) -> LockoutPolicy {
        LockoutPolicy {
            max_failed_attempts: self.lockout.max_failed_attempts,
            window: Duration::minutes(self.lockout.window_minutes),
        }
    }

    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy {
            max_key_age: Duration::days(self.rotation.max_key_age_days),
            warning: Duration::days(self.rotation.warning_days),
        }
    }
}
