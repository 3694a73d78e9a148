//! Holder key resolution
//!
//! A share row only names its holder (`holder_key_ref`). The keyring turns
//! that name into the key the share was sealed with.
//!
//! - [`MemoryKeyring`]: in-process map, for tests and embedding
//! - [`FileKeyring`]: one hex file per holder under a directory, plus an
//!   optional escrow key derived from a passphrase

use crate::error::{Result, VaultError};
use heirloom_core::{HolderKey, HolderKeyRef};
use heirloom_shamir::HolderKeys;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Shared, thread-safe keyring handle
pub type SharedKeyring = Arc<dyn HolderKeys + Send + Sync>;

const KEY_FILE_EXT: &str = "key";

#[derive(Default)]
pub struct MemoryKeyring {
    keys: RwLock<HashMap<HolderKeyRef, HolderKey>>,
}

impl MemoryKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, holder: HolderKeyRef, key: HolderKey) {
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(holder, key);
    }

    /// Generate and store a fresh key for `holder`.
    pub fn generate(&self, holder: &HolderKeyRef) -> HolderKey {
        let key = HolderKey::generate();
        self.insert(holder.clone(), key.clone());
        key
    }

    pub fn remove(&self, holder: &HolderKeyRef) -> Option<HolderKey> {
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(holder)
    }
}

impl HolderKeys for MemoryKeyring {
    fn holder_key(&self, holder: &HolderKeyRef) -> Option<HolderKey> {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(holder)
            .cloned()
    }
}

/// Holder keys stored as `<dir>/<holder_ref>.key`, hex encoded.
pub struct FileKeyring {
    dir: PathBuf,
    escrow: Option<(HolderKeyRef, HolderKey)>,
}

impl FileKeyring {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            escrow: None,
        }
    }

    /// Serve `escrow_ref` from a passphrase-derived key instead of a file.
    pub fn with_escrow(mut self, escrow_ref: HolderKeyRef, key: HolderKey) -> Self {
        self.escrow = Some((escrow_ref, key));
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Generate a key for `holder` and write it out. Refuses to overwrite.
    pub fn generate(&self, holder: &HolderKeyRef) -> Result<HolderKey> {
        let path = self.key_path(holder)?;
        if path.exists() {
            return Err(VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("key file already exists: {}", path.display()),
            )));
        }

        std::fs::create_dir_all(&self.dir)?;
        let key = HolderKey::generate();
        std::fs::write(&path, key.to_hex().as_bytes())?;
        restrict_permissions(&path)?;

        log::info!("Generated holder key '{}'", holder);
        Ok(key)
    }

    fn key_path(&self, holder: &HolderKeyRef) -> Result<PathBuf> {
        if !is_valid_ref(holder.as_str()) {
            return Err(VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid holder key reference: {:?}", holder.as_str()),
            )));
        }
        Ok(self
            .dir
            .join(format!("{}.{}", holder.as_str(), KEY_FILE_EXT)))
    }
}

impl HolderKeys for FileKeyring {
    fn holder_key(&self, holder: &HolderKeyRef) -> Option<HolderKey> {
        if let Some((escrow_ref, key)) = &self.escrow {
            if escrow_ref == holder {
                return Some(key.clone());
            }
        }

        let path = match self.key_path(holder) {
            Ok(path) => path,
            Err(e) => {
                log::warn!("{}", e);
                return None;
            }
        };

        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => zeroize::Zeroizing::new(contents),
            Err(e) => {
                log::warn!("Cannot read holder key '{}': {}", holder, e);
                return None;
            }
        };

        match HolderKey::from_hex(&contents) {
            Ok(key) => Some(key),
            Err(e) => {
                log::warn!("Holder key '{}' is malformed: {}", holder, e);
                None
            }
        }
    }
}

/// Letters, digits, `-` and `_` only, so a reference can never leave the
/// key directory.
fn is_valid_ref(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_keyring() {
        let ring = MemoryKeyring::new();
        let holder = HolderKeyRef::from("owner-device");
        assert!(ring.holder_key(&holder).is_none());

        let key = ring.generate(&holder);
        assert_eq!(
            ring.holder_key(&holder).unwrap().to_hex(),
            key.to_hex()
        );

        ring.remove(&holder);
        assert!(ring.holder_key(&holder).is_none());
    }

    #[test]
    fn test_file_keyring_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ring = FileKeyring::new(dir.path().join("keys"));
        let holder = HolderKeyRef::from("contact-a");

        let key = ring.generate(&holder).unwrap();
        assert_eq!(ring.holder_key(&holder).unwrap().to_hex(), key.to_hex());

        // Never overwrite an existing key
        assert!(ring.generate(&holder).is_err());

        assert!(ring.holder_key(&HolderKeyRef::from("missing")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let ring = FileKeyring::new(dir.path());
        ring.generate(&HolderKeyRef::from("owner")).unwrap();

        let mode = std::fs::metadata(dir.path().join("owner.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ring = FileKeyring::new(dir.path());
        assert!(ring.generate(&HolderKeyRef::from("../evil")).is_err());
        assert!(ring.holder_key(&HolderKeyRef::from("../evil")).is_none());
        assert!(ring.holder_key(&HolderKeyRef::from("")).is_none());
    }

    #[test]
    fn test_escrow_key_served_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let escrow = HolderKey::derive_from_passphrase("long escrow passphrase", b"heirloom-escrow")
            .unwrap();
        let ring = FileKeyring::new(dir.path()).with_escrow(HolderKeyRef::from("escrow"), escrow.clone());

        assert_eq!(
            ring.holder_key(&HolderKeyRef::from("escrow")).unwrap().to_hex(),
            escrow.to_hex()
        );
    }
}
