use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use crate::error::{Result, VaultError};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "credvault";
pub const APP_NAME: &str = "credvault";
pub const DATA_DIR_ENV: &str = "CREDVAULT_DATA_DIR";
pub const STORE_FILE: &str = "records.json";
pub const SETTINGS_FILE: &str = "settings.json";

/// `CREDVAULT_DATA_DIR` when set, otherwise the platform data directory.
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| VaultError::Settings("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn store_path(dir: &Path) -> PathBuf {
    dir.join(STORE_FILE)
}

pub fn settings_path(dir: &Path) -> PathBuf {
    dir.join(SETTINGS_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_live_under_the_data_dir() {
        let dir = Path::new("/tmp/credvault-test");
        assert_eq!(store_path(dir), dir.join("records.json"));
        assert_eq!(settings_path(dir), dir.join("settings.json"));
    }
}
