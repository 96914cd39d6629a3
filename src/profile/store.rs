use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::{VaultError, VaultResult};

use super::record::{ProfileRecord, PROFILE_SCHEMA_VERSION};

/// Atomic write using temp file + rename, durable against power failure:
/// write temp → fsync → rename → fsync containing directory.
pub fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;

    // Temp file must live in the SAME directory for the rename to be atomic.
    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(data)?;
    temp_file.as_file().sync_all()?;

    restrict_file_permissions(temp_file.path())?;

    temp_file.persist(path).map_err(|e| e.error)?;

    // The rename itself must survive a crash.
    sync_dir(dir)?;
    Ok(())
}

#[cfg(unix)]
pub fn restrict_file_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
pub fn restrict_file_permissions(_path: &Path) -> std::io::Result<()> {
    // Windows: files under the user profile inherit an owner-only ACL.
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    // Directory handles cannot be fsynced on Windows.
    Ok(())
}

/// Flat on-disk store of profile records: one JSON file per profile id,
/// owner-only permissions. Record contents are not themselves encrypted —
/// the verifier is a KDF output and both wrapped keys are AEAD ciphertext.
#[derive(Debug, Clone)]
pub struct SecretStore {
    dir: PathBuf,
}

impl SecretStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn record_path(&self, profile_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", profile_id))
    }

    pub fn exists(&self, profile_id: &str) -> bool {
        self.record_path(profile_id).exists()
    }

    pub fn save(&self, record: &ProfileRecord) -> VaultResult<()> {
        let json = serde_json::to_vec_pretty(record)?;
        atomic_write(&self.record_path(&record.id), &json)?;
        Ok(())
    }

    pub fn load(&self, profile_id: &str) -> VaultResult<ProfileRecord> {
        let path = self.record_path(profile_id);
        if !path.exists() {
            return Err(VaultError::NotFound);
        }
        let content = fs::read_to_string(&path)?;
        let record: ProfileRecord = serde_json::from_str(&content)?;
        if record.schema_version != PROFILE_SCHEMA_VERSION {
            return Err(VaultError::Schema(record.schema_version));
        }
        Ok(record)
    }

    /// All readable profile records. Unparseable files are skipped with a
    /// warning rather than failing the whole listing.
    pub fn load_all(&self) -> VaultResult<Vec<ProfileRecord>> {
        let mut records = Vec::new();
        if !self.dir.exists() {
            return Ok(records);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(stem) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("Skipping unreadable profile record {:?}: {}", path, e);
                }
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Securely wipe a record: overwrite the file contents in place, sync,
    /// then remove. Plain `remove_file` would leave the verifier and
    /// wrapped keys recoverable from the freed blocks.
    pub fn wipe(&self, profile_id: &str) -> VaultResult<()> {
        let path = self.record_path(profile_id);
        if !path.exists() {
            return Err(VaultError::NotFound);
        }

        let len = fs::metadata(&path)?.len() as usize;
        {
            let mut file = fs::OpenOptions::new().write(true).open(&path)?;
            file.write_all(&vec![0u8; len])?;
            file.sync_all()?;
        }
        fs::remove_file(&path)?;
        sync_dir(&self.dir)?;
        Ok(())
    }
}
