//! The long-term identity store.
//!
//! `identity.json` holds `{"secretKey": "<hex>"}` with owner-only
//! permissions. Ephemeral mode generates a fresh in-memory keypair and
//! never touches the file, even when a saved identity exists.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use pulse_crypto::bech32::{self, KeyKind};
use pulse_crypto::keys::Keypair;
use pulse_store::atomic::{self, FileMode};
use pulse_store::paths::DataDir;

use crate::{Result, WorkerError};

/// Comma-separated tokens that authorize secret-key export.
pub const EXPORT_AUTH_ENV: &str = "SECRET_KEY_EXPORT_AUTH";

#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    #[serde(rename = "secretKey")]
    secret_key: String,
}

/// The agent's keypair plus how it was obtained.
#[derive(Debug, Clone)]
pub struct Identity {
    keypair: Keypair,
    ephemeral: bool,
}

impl Identity {
    /// Load the persisted identity, creating one on first run. With
    /// `ephemeral`, generate in memory and skip both read and write.
    pub fn load_or_create(data: &DataDir, ephemeral: bool) -> Result<Self> {
        if ephemeral {
            let keypair = Keypair::generate();
            info!(pubkey = keypair.public_hex(), "ephemeral identity generated");
            return Ok(Self {
                keypair,
                ephemeral: true,
            });
        }

        let path = data.identity_file();
        atomic::refuse_symlink(&path)?;
        if path.exists() {
            atomic::require_private(&path)?;
            let file: IdentityFile = atomic::read_json(&path)?.ok_or_else(|| {
                WorkerError::Store(pulse_store::StoreError::Serialization(
                    "empty identity file".to_string(),
                ))
            })?;
            let keypair = Keypair::from_secret_hex(&file.secret_key)?;
            info!(pubkey = keypair.public_hex(), "identity loaded");
            return Ok(Self {
                keypair,
                ephemeral: false,
            });
        }

        let keypair = Keypair::generate();
        atomic::write_json(
            &path,
            &IdentityFile {
                secret_key: keypair.secret_hex(),
            },
            FileMode::Private,
        )?;
        info!(pubkey = keypair.public_hex(), "identity created");
        Ok(Self {
            keypair,
            ephemeral: false,
        })
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// The x-only public key, lowercase hex.
    pub fn public_hex(&self) -> &str {
        self.keypair.public_hex()
    }

    /// The public key in npub form.
    pub fn public_npub(&self) -> Result<String> {
        Ok(bech32::encode(KeyKind::Public, self.keypair.public_hex())?)
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Export the secret key, gated on `SECRET_KEY_EXPORT_AUTH` containing
    /// the caller's token. Unauthorized attempts are logged and rejected.
    pub fn export_secret(&self, token: &str, as_nsec: bool) -> Result<String> {
        let authorized = std::env::var(EXPORT_AUTH_ENV)
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .any(|t| !t.is_empty() && t == token)
            })
            .unwrap_or(false);
        if !authorized {
            warn!("rejected secret key export attempt");
            return Err(WorkerError::ExportUnauthorized);
        }

        if as_nsec {
            Ok(bech32::encode(KeyKind::Secret, &self.keypair.secret_hex())?)
        } else {
            Ok(self.keypair.secret_hex())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());

        let created = Identity::load_or_create(&data, false).expect("create");
        assert!(data.identity_file().exists());

        let loaded = Identity::load_or_create(&data, false).expect("load");
        assert_eq!(created.public_hex(), loaded.public_hex());
        assert!(!loaded.is_ephemeral());
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());
        Identity::load_or_create(&data, false).expect("create");
        let mode = std::fs::metadata(data.identity_file())
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_loose_permissions_rejected() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());
        Identity::load_or_create(&data, false).expect("create");
        std::fs::set_permissions(
            data.identity_file(),
            std::fs::Permissions::from_mode(0o644),
        )
        .expect("chmod");
        assert!(Identity::load_or_create(&data, false).is_err());
    }

    #[test]
    fn test_ephemeral_ignores_saved_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());

        let saved = Identity::load_or_create(&data, false).expect("create");
        let before = std::fs::read_to_string(data.identity_file()).expect("read");

        let ephemeral = Identity::load_or_create(&data, true).expect("ephemeral");
        assert!(ephemeral.is_ephemeral());
        assert_ne!(ephemeral.public_hex(), saved.public_hex());
        // Saved record untouched
        let after = std::fs::read_to_string(data.identity_file()).expect("read");
        assert_eq!(before, after);
    }

    #[test]
    fn test_export_requires_authorization() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());
        let identity = Identity::load_or_create(&data, true).expect("ephemeral");
        // EXPORT_AUTH_ENV unset in tests
        assert!(matches!(
            identity.export_secret("any-token", false),
            Err(WorkerError::ExportUnauthorized)
        ));
    }

    #[test]
    fn test_npub_form() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());
        let identity = Identity::load_or_create(&data, true).expect("ephemeral");
        assert!(identity.public_npub().expect("npub").starts_with("npub1"));
    }
}
