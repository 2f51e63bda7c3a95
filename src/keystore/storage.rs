//! Keystore file on disk

use crate::errors::{ProxyError, Result};
use crate::keystore::v3::KeystoreV3;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Location of the single keystore document
pub struct KeystoreStorage {
    path: PathBuf,
}

impl KeystoreStorage {
    /// Create storage for the given file, creating its directory if needed
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if a keystore exists
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the keystore document
    pub fn load(&self) -> Result<KeystoreV3> {
        if !self.exists() {
            return Err(ProxyError::NoWalletFound);
        }
        let json = fs::read_to_string(&self.path)?;
        KeystoreV3::from_json(&json)
    }

    /// Persist the keystore document
    pub fn store(&self, keystore: &KeystoreV3) -> Result<()> {
        write_atomic(&self.path, keystore.to_json()?.as_bytes())?;
        debug!("Wrote keystore to {:?}", self.path);
        Ok(())
    }
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
/// The file is only readable by the owner on Unix.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| ProxyError::StorageError(format!("not a file path: {:?}", path)))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    Ok(())
}
