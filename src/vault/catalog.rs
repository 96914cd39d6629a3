use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::config::VaultPaths;
use crate::crypto::{CryptoEngine, DerivedKey};
use crate::error::{VaultError, VaultResult};
use crate::profile::store::atomic_write;

use super::entry::{EntryState, VaultEntry};
use super::metadata::VaultMetadata;

const ENTRY_EXT: &str = "entry";

/// Cleartext summary of the catalog, written after every mutation so
/// readers can detect a torn multi-file update.
#[derive(Debug, Serialize, Deserialize)]
struct CatalogManifest {
    schema_version: u32,
    entry_count: usize,
    updated_at: DateTime<Utc>,
}

/// Result of an integrity sweep.
#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub ok: bool,
    /// Entries whose backup is missing or whose metadata tag fails.
    pub damaged_ids: Vec<String>,
    /// Blob directories with no catalog entry, moved to quarantine.
    pub quarantined: Vec<PathBuf>,
}

/// Per-profile index of hidden folders: one `.entry` file per folder under
/// `catalog/`, plus `manifest.json`. All mutations are temp-and-rename;
/// the manifest is always written last.
pub struct VaultCatalog {
    profile_id: String,
    catalog_dir: PathBuf,
    blobs_dir: PathBuf,
    quarantine_dir: PathBuf,
}

impl VaultCatalog {
    pub fn open(profile_id: &str, paths: &VaultPaths) -> VaultResult<Self> {
        paths.bootstrap_profile(profile_id)?;
        Ok(Self {
            profile_id: profile_id.to_string(),
            catalog_dir: paths.catalog_dir(profile_id),
            blobs_dir: paths.blobs_dir(profile_id),
            quarantine_dir: paths.quarantine_dir(profile_id),
        })
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    fn entry_path(&self, obfuscated_id: &str) -> PathBuf {
        self.catalog_dir.join(format!("{}.{}", obfuscated_id, ENTRY_EXT))
    }

    fn manifest_path(&self) -> PathBuf {
        self.catalog_dir.join("manifest.json")
    }

    fn write_manifest(&self) -> VaultResult<()> {
        let manifest = CatalogManifest {
            schema_version: super::entry::ENTRY_SCHEMA_VERSION,
            entry_count: self.entry_ids()?.len(),
            updated_at: Utc::now(),
        };
        atomic_write(&self.manifest_path(), &serde_json::to_vec_pretty(&manifest)?)?;
        Ok(())
    }

    fn entry_ids(&self) -> VaultResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.catalog_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    // ==================== MUTATIONS ====================

    pub fn insert(&self, entry: &VaultEntry) -> VaultResult<()> {
        if self.entry_path(&entry.obfuscated_id).exists() {
            return Err(VaultError::AlreadyExists);
        }
        self.persist(entry)
    }

    /// Write an entry (new or updated), then refresh the manifest.
    pub fn persist(&self, entry: &VaultEntry) -> VaultResult<()> {
        atomic_write(
            &self.entry_path(&entry.obfuscated_id),
            &serde_json::to_vec_pretty(entry)?,
        )?;
        self.write_manifest()
    }

    pub fn set_state(&self, obfuscated_id: &str, state: EntryState) -> VaultResult<VaultEntry> {
        let mut entry = self.lookup(obfuscated_id)?;
        entry.state = state;
        if state == EntryState::TemporarilyUnlocked {
            entry.last_unlocked_at = Some(Utc::now());
        }
        self.persist(&entry)?;
        Ok(entry)
    }

    pub fn remove(&self, obfuscated_id: &str) -> VaultResult<()> {
        let path = self.entry_path(obfuscated_id);
        if !path.exists() {
            return Err(VaultError::NotFound);
        }
        fs::remove_file(path)?;
        self.write_manifest()
    }

    // ==================== QUERIES ====================

    pub fn lookup(&self, obfuscated_id: &str) -> VaultResult<VaultEntry> {
        let path = self.entry_path(obfuscated_id);
        if !path.exists() {
            return Err(VaultError::NotFound);
        }
        let content = fs::read_to_string(&path)?;
        let entry: VaultEntry = serde_json::from_str(&content)?;
        Ok(entry)
    }

    pub fn list(&self) -> VaultResult<Vec<VaultEntry>> {
        let mut entries = Vec::new();
        for id in self.entry_ids()? {
            match self.lookup(&id) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(entry = %id, "Unreadable catalog entry: {}", e);
                }
            }
        }
        Ok(entries)
    }

    /// Decrypt an entry's metadata blob under the session metadata key.
    /// A tag failure here means the entry (or the key) is wrong — the
    /// caller decides whether that marks the entry corrupted.
    pub fn decrypt_metadata(
        &self,
        entry: &VaultEntry,
        engine: &CryptoEngine,
        metadata_key: &DerivedKey,
    ) -> VaultResult<VaultMetadata> {
        let nonce = hex::decode(&entry.metadata_nonce).map_err(|_| VaultError::Corrupted)?;
        let ciphertext =
            hex::decode(&entry.metadata_ciphertext).map_err(|_| VaultError::Corrupted)?;

        let expected_aad =
            VaultEntry::metadata_aad_for(&self.profile_id, &entry.obfuscated_id);
        if entry.metadata_aad != expected_aad {
            return Err(VaultError::Corrupted);
        }

        let plaintext = engine
            .aead_decrypt(metadata_key, &nonce, entry.metadata_aad.as_bytes(), &ciphertext)
            .map_err(|_| VaultError::Corrupted)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    // ==================== INTEGRITY ====================

    /// Sweep the catalog: verify each entry's backup exists and its
    /// metadata tag opens; quarantine blob directories no entry claims.
    /// Orphans are moved, never deleted — they may be the only surviving
    /// copy of something.
    pub fn verify(
        &self,
        engine: &CryptoEngine,
        metadata_key: &DerivedKey,
        profile_root: &PathBuf,
    ) -> VaultResult<IntegrityReport> {
        let mut report = IntegrityReport::default();
        let entries = self.list()?;

        for entry in &entries {
            let backup = profile_root.join(&entry.backup_rel_path);
            if !backup.is_dir() {
                report.damaged_ids.push(entry.obfuscated_id.clone());
                continue;
            }
            if self.decrypt_metadata(entry, engine, metadata_key).is_err() {
                report.damaged_ids.push(entry.obfuscated_id.clone());
            }
        }

        let known: std::collections::HashSet<String> =
            entries.iter().map(|e| e.obfuscated_id.clone()).collect();

        if self.blobs_dir.exists() {
            for dir_entry in fs::read_dir(&self.blobs_dir)? {
                let path = dir_entry?.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if known.contains(name) {
                    continue;
                }
                let dest = self.quarantine_dir.join(name);
                match fs::rename(&path, &dest) {
                    Ok(()) => report.quarantined.push(dest),
                    Err(e) => {
                        tracing::warn!(blob = %name, "Failed to quarantine orphan blob: {}", e);
                    }
                }
            }
        }

        report.ok = report.damaged_ids.is_empty() && report.quarantined.is_empty();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::entry::ENTRY_SCHEMA_VERSION;

    fn entry(id: &str) -> VaultEntry {
        VaultEntry {
            schema_version: ENTRY_SCHEMA_VERSION,
            obfuscated_id: id.to_string(),
            backup_rel_path: format!("blobs/{}", id),
            content_checksum: "00".repeat(32),
            metadata_ciphertext: "11".repeat(40),
            metadata_nonce: "22".repeat(12),
            metadata_aad: VaultEntry::metadata_aad_for("prof", id),
            state: EntryState::Locked,
            created_at: Utc::now(),
            last_unlocked_at: None,
        }
    }

    fn catalog() -> (tempfile::TempDir, VaultCatalog) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = VaultPaths::at(tmp.path().join("data"));
        paths.bootstrap().unwrap();
        let catalog = VaultCatalog::open("prof", &paths).unwrap();
        (tmp, catalog)
    }

    #[test]
    fn test_insert_lookup_list() {
        let (_tmp, cat) = catalog();
        cat.insert(&entry("aaaa")).unwrap();
        cat.insert(&entry("bbbb")).unwrap();

        assert_eq!(cat.lookup("aaaa").unwrap().obfuscated_id, "aaaa");
        assert_eq!(cat.list().unwrap().len(), 2);
        assert!(matches!(cat.lookup("cccc"), Err(VaultError::NotFound)));
    }

    #[test]
    fn test_double_insert_rejected() {
        let (_tmp, cat) = catalog();
        cat.insert(&entry("aaaa")).unwrap();
        assert!(matches!(cat.insert(&entry("aaaa")), Err(VaultError::AlreadyExists)));
    }

    #[test]
    fn test_state_transition_persisted() {
        let (_tmp, cat) = catalog();
        cat.insert(&entry("aaaa")).unwrap();

        let updated = cat.set_state("aaaa", EntryState::TemporarilyUnlocked).unwrap();
        assert!(updated.last_unlocked_at.is_some());

        let reread = cat.lookup("aaaa").unwrap();
        assert_eq!(reread.state, EntryState::TemporarilyUnlocked);
    }

    #[test]
    fn test_remove() {
        let (_tmp, cat) = catalog();
        cat.insert(&entry("aaaa")).unwrap();
        cat.remove("aaaa").unwrap();
        assert!(matches!(cat.lookup("aaaa"), Err(VaultError::NotFound)));
        assert!(matches!(cat.remove("aaaa"), Err(VaultError::NotFound)));
    }

    #[test]
    fn test_manifest_tracks_count() {
        let (_tmp, cat) = catalog();
        cat.insert(&entry("aaaa")).unwrap();
        cat.insert(&entry("bbbb")).unwrap();
        cat.remove("aaaa").unwrap();

        let manifest: CatalogManifest =
            serde_json::from_str(&fs::read_to_string(cat.manifest_path()).unwrap()).unwrap();
        assert_eq!(manifest.entry_count, 1);
    }
}
