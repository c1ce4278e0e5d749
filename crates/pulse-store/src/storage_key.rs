//! Loading the encrypt-at-rest storage key.

use pulse_crypto::envelope::StorageKey;

use crate::atomic::{self, FileMode};
use crate::paths::DataDir;
use crate::Result;

/// Environment variable that derives the storage key from a password
/// instead of the on-disk random key.
pub const KEY_PASSWORD_ENV: &str = "AGENT_PULSE_KEY_PASSWORD";

/// Obtain the storage key for a data directory.
///
/// Order: `AGENT_PULSE_KEY_PASSWORD` wins when set (the key file is not
/// consulted); otherwise the persisted `.storage_key` is read, or created
/// with 32 random bytes on first use.
pub fn load_or_create(data: &DataDir) -> Result<StorageKey> {
    if let Ok(password) = std::env::var(KEY_PASSWORD_ENV) {
        if !password.is_empty() {
            return Ok(StorageKey::from_password(&password));
        }
    }

    let path = data.storage_key_file();
    atomic::refuse_symlink(&path)?;
    if path.exists() {
        atomic::require_private(&path)?;
        let key_hex = std::fs::read_to_string(&path)?;
        return Ok(StorageKey::from_hex(&key_hex)?);
    }

    let key = StorageKey::generate();
    atomic::write_atomic(&path, key.to_hex().as_bytes(), FileMode::Private)?;
    Ok(key)
}
