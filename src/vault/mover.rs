//! Moves folders into and out of the vault. Ingest streams every regular
//! file through the chunked AEAD codec into a flat directory of opaque
//! blob names; the real tree shape travels only inside the encrypted
//! metadata blob. Restore materializes the tree, verifies the content
//! checksum, and applies captured metadata in restore order.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::config::VaultPaths;
use crate::crypto::stream::{decrypt_stream, encrypt_stream};
use crate::crypto::CryptoEngine;
use crate::error::{VaultError, VaultResult};
use crate::profile::Session;
use crate::security::privilege::PrivilegeProvider;

use super::entry::{EntryState, VaultEntry, ENTRY_SCHEMA_VERSION};
use super::metadata::{
    self, RestoreWarning, TreeDir, TreeFile, TreeManifest, TreeSymlink, VaultMetadata,
};
use super::wipe;

const TREE_HASH_CONTEXT: &[u8] = b"phantomvault.tree.v1";

/// Flat scan of a folder, relative paths normalized to `/` separators and
/// sorted, so checksums are reproducible across platforms and runs.
struct TreeScan {
    dirs: Vec<(String, PathBuf)>,
    files: Vec<(String, PathBuf, u64)>,
    symlinks: Vec<(String, String)>,
}

fn rel_string(root: &Path, path: &Path) -> VaultResult<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| VaultError::InvalidState)?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn scan_tree(root: &Path) -> VaultResult<TreeScan> {
    let mut scan = TreeScan {
        dirs: Vec::new(),
        files: Vec::new(),
        symlinks: Vec::new(),
    };

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            VaultError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "walk failed")
            }))
        })?;
        let path = entry.path();
        if path == root {
            continue;
        }
        let rel = rel_string(root, path)?;
        let file_type = entry.file_type();

        if file_type.is_dir() {
            scan.dirs.push((rel, path.to_path_buf()));
        } else if file_type.is_symlink() {
            let target = fs::read_link(path)?;
            scan.symlinks.push((rel, target.to_string_lossy().into_owned()));
        } else if file_type.is_file() {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            scan.files.push((rel, path.to_path_buf(), len));
        } else {
            // Sockets, fifos, and devices cannot be restored; refusing is
            // better than losing them silently.
            return Err(VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "folder contains a special file",
            )));
        }
    }

    scan.dirs.sort_by(|a, b| a.0.cmp(&b.0));
    scan.files.sort_by(|a, b| a.0.cmp(&b.0));
    scan.symlinks.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(scan)
}

/// Deterministic digest of a folder tree: structure, names, and file
/// contents (via per-file SHA-256). Computed before encryption and again
/// after restore; the two must match bit for bit.
fn tree_checksum(engine: &CryptoEngine, scan: &TreeScan) -> VaultResult<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(TREE_HASH_CONTEXT);

    for (rel, _) in &scan.dirs {
        hasher.update(b"D");
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
    }
    for (rel, path, len) in &scan.files {
        hasher.update(b"F");
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(len.to_le_bytes());
        hasher.update(engine.hash_file(path)?);
    }
    for (rel, target) in &scan.symlinks {
        hasher.update(b"L");
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(target.as_bytes());
        hasher.update([0u8]);
    }

    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Ingests folders into the vault and restores them back.
pub struct FolderMover {
    engine: Arc<CryptoEngine>,
    paths: VaultPaths,
}

impl FolderMover {
    pub fn new(engine: Arc<CryptoEngine>, paths: VaultPaths) -> Self {
        Self { engine, paths }
    }

    // ==================== INGEST ====================

    /// Encrypt `source` into the vault and dispose of the plaintext.
    /// Returns the catalog entry to persist. If anything fails before the
    /// source is touched, the partial backup is removed and the source is
    /// left exactly as it was.
    pub fn hide(&self, source: &Path, session: &Session) -> VaultResult<VaultEntry> {
        self.validate_source(source)?;

        let profile_id = session.profile_id();
        let obfuscated_id = hex::encode(self.engine.new_opaque_id()?);
        let backup_rel = format!("blobs/{}", obfuscated_id);
        let backup_dir = self.paths.profile_vault_dir(profile_id).join(&backup_rel);

        let entry = match self.encrypt_folder(source, session, &obfuscated_id, &backup_dir) {
            Ok(entry) => entry,
            Err(e) => {
                // Ciphertext only; plain removal is enough.
                let _ = fs::remove_dir_all(&backup_dir);
                return Err(e);
            }
        };

        self.dispose_source(source, profile_id, &obfuscated_id)?;
        Ok(entry)
    }

    fn validate_source(&self, source: &Path) -> VaultResult<()> {
        let md = fs::symlink_metadata(source).map_err(|_| VaultError::NotFound)?;
        if md.file_type().is_symlink() || !md.is_dir() {
            return Err(VaultError::InvalidState);
        }

        // A folder inside the vault root must never be ingested into
        // itself.
        let canonical = source.canonicalize()?;
        if let Ok(root) = self.paths.root.canonicalize() {
            if canonical.starts_with(&root) {
                return Err(VaultError::InvalidState);
            }
        }
        Ok(())
    }

    /// Stream every file into the backup directory and build the entry.
    fn encrypt_folder(
        &self,
        source: &Path,
        session: &Session,
        obfuscated_id: &str,
        backup_dir: &Path,
    ) -> VaultResult<VaultEntry> {
        let scan = scan_tree(source)?;
        let checksum = tree_checksum(&self.engine, &scan)?;
        let folder = metadata::capture_folder(source)?;

        fs::create_dir_all(backup_dir)?;
        crate::config::restrict_dir_permissions(backup_dir)?;

        let content_key = session.content_key();
        let mut manifest = TreeManifest::default();

        for (rel, path) in &scan.dirs {
            manifest.dirs.push(TreeDir {
                rel_path: rel.clone(),
                meta: metadata::capture_node(path)?,
            });
        }

        for (rel, path, len) in &scan.files {
            let blob_id = self.engine.new_opaque_id()?;
            let blob_name = hex::encode(blob_id);

            let mut reader = BufReader::new(fs::File::open(path)?);
            let blob_path = backup_dir.join(&blob_name);
            let mut writer = BufWriter::new(fs::File::create(&blob_path)?);
            encrypt_stream(&content_key, blob_id, *len, &mut reader, &mut writer)?;
            crate::profile::store::restrict_file_permissions(&blob_path)?;

            manifest.files.push(TreeFile {
                rel_path: rel.clone(),
                blob_name,
                size: *len,
                meta: metadata::capture_node(path)?,
            });
        }

        for (rel, target) in &scan.symlinks {
            manifest.symlinks.push(TreeSymlink {
                rel_path: rel.clone(),
                target: target.clone(),
            });
        }

        let vault_meta = VaultMetadata {
            folder,
            tree: manifest,
        };
        let meta_plain = serde_json::to_vec(&vault_meta)?;
        let metadata_key = session.metadata_key();
        let nonce = self.engine.new_nonce()?;
        let aad = VaultEntry::metadata_aad_for(session.profile_id(), obfuscated_id);
        let ciphertext =
            self.engine
                .aead_encrypt(&metadata_key, &nonce, aad.as_bytes(), &meta_plain)?;

        Ok(VaultEntry {
            schema_version: ENTRY_SCHEMA_VERSION,
            obfuscated_id: obfuscated_id.to_string(),
            backup_rel_path: format!("blobs/{}", obfuscated_id),
            content_checksum: hex::encode(checksum),
            metadata_ciphertext: hex::encode(ciphertext),
            metadata_nonce: hex::encode(nonce),
            metadata_aad: aad,
            state: EntryState::Locked,
            created_at: Utc::now(),
            last_unlocked_at: None,
        })
    }

    /// Move the plaintext source into the staging area, then wipe it.
    /// Rename is atomic on the same filesystem; across filesystems the
    /// wipe runs in place.
    fn dispose_source(
        &self,
        source: &Path,
        profile_id: &str,
        obfuscated_id: &str,
    ) -> VaultResult<()> {
        let staged = self
            .paths
            .tmp_dir(profile_id)
            .join(format!("{}.staged", obfuscated_id));

        match fs::rename(source, &staged) {
            Ok(()) => {
                if let Err(e) = wipe::secure_remove_dir(&staged) {
                    tracing::warn!("Staged source wipe incomplete: {}", e);
                }
            }
            Err(_) => {
                // Different filesystem; wipe where it stands.
                wipe::secure_remove_dir(source)?;
            }
        }
        Ok(())
    }

    // ==================== RESTORE ====================

    /// Materialize an entry at its original path. Content is verified
    /// against the stored checksum before metadata is applied; a mismatch
    /// wipes the partial restore and reports `IntegrityViolation`.
    pub fn unhide(
        &self,
        entry: &VaultEntry,
        meta: &VaultMetadata,
        session: &Session,
        privileges: &dyn PrivilegeProvider,
    ) -> VaultResult<Vec<RestoreWarning>> {
        let backup_dir = self
            .paths
            .profile_vault_dir(session.profile_id())
            .join(&entry.backup_rel_path);
        if !backup_dir.is_dir() {
            return Err(VaultError::IntegrityViolation);
        }

        let target = PathBuf::from(&meta.folder.original_path);
        if target.exists() {
            return Err(VaultError::AlreadyExists);
        }

        match self.materialize(entry, meta, session, &backup_dir, &target, privileges) {
            Ok(warnings) => Ok(warnings),
            Err(e) => {
                // Never leave a half-restored plaintext tree behind.
                let _ = wipe::secure_remove_dir(&target);
                Err(e)
            }
        }
    }

    fn materialize(
        &self,
        entry: &VaultEntry,
        meta: &VaultMetadata,
        session: &Session,
        backup_dir: &Path,
        target: &Path,
        privileges: &dyn PrivilegeProvider,
    ) -> VaultResult<Vec<RestoreWarning>> {
        if let Some(parent) = target.parent() {
            if !parent.exists() {
                return Err(VaultError::NotFound);
            }
        }
        fs::create_dir(target)?;

        // Parents sort before children, so plain lexicographic order
        // creates directories top-down.
        let mut dirs = meta.tree.dirs.clone();
        dirs.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        for dir in &dirs {
            fs::create_dir_all(target.join(rel_to_native(&dir.rel_path)))?;
        }

        let content_key = session.content_key();
        for file in &meta.tree.files {
            let blob_path = backup_dir.join(&file.blob_name);
            let mut blob_id = [0u8; 16];
            let decoded =
                hex::decode(&file.blob_name).map_err(|_| VaultError::Corrupted)?;
            if decoded.len() != 16 {
                return Err(VaultError::Corrupted);
            }
            blob_id.copy_from_slice(&decoded);

            let mut reader = BufReader::new(
                fs::File::open(&blob_path).map_err(|_| VaultError::IntegrityViolation)?,
            );
            let out_path = target.join(rel_to_native(&file.rel_path));
            let mut writer = BufWriter::new(fs::File::create(&out_path)?);
            decrypt_stream(&content_key, Some(&blob_id), &mut reader, &mut writer)
                .map_err(|e| match e {
                    crate::crypto::CryptoError::InvalidTag => VaultError::IntegrityViolation,
                    other => VaultError::Crypto(other),
                })?;
        }

        for link in &meta.tree.symlinks {
            create_symlink(&link.target, &target.join(rel_to_native(&link.rel_path)))?;
        }

        // Verify the restored tree matches what was ingested.
        let scan = scan_tree(target)?;
        let checksum = tree_checksum(&self.engine, &scan)?;
        let expected = hex::decode(&entry.content_checksum).map_err(|_| VaultError::Corrupted)?;
        if !self.engine.ct_eq(&checksum, &expected) {
            return Err(VaultError::IntegrityViolation);
        }

        // Metadata after verification: files first, then directories
        // bottom-up, root last, so parent timestamps survive child writes.
        let mut warnings = Vec::new();
        for file in &meta.tree.files {
            let path = target.join(rel_to_native(&file.rel_path));
            warnings.extend(metadata::apply_node(&path, &file.meta, &file.rel_path, privileges));
        }
        dirs.sort_by(|a, b| b.rel_path.cmp(&a.rel_path));
        for dir in &dirs {
            let path = target.join(rel_to_native(&dir.rel_path));
            warnings.extend(metadata::apply_node(&path, &dir.meta, &dir.rel_path, privileges));
        }
        warnings.extend(metadata::apply_node(target, &meta.folder.root, ".", privileges));

        Ok(warnings)
    }

    // ==================== RELOCK ====================

    /// Re-ingest a temporarily unlocked folder into its existing entry.
    /// The content may have changed while unlocked, so blobs, checksum,
    /// and metadata are rebuilt; the swap is staged so a failure leaves
    /// both the old backup and the plaintext intact.
    pub fn relock(
        &self,
        entry: &VaultEntry,
        meta: &VaultMetadata,
        session: &Session,
    ) -> VaultResult<VaultEntry> {
        let source = PathBuf::from(&meta.folder.original_path);
        if !source.is_dir() {
            return Err(VaultError::NotFound);
        }

        let profile_id = session.profile_id();
        let profile_root = self.paths.profile_vault_dir(profile_id);
        let backup_dir = profile_root.join(&entry.backup_rel_path);
        let staging_dir = profile_root.join(format!("{}.new", &entry.backup_rel_path));

        let mut new_entry =
            match self.encrypt_folder(&source, session, &entry.obfuscated_id, &staging_dir) {
                Ok(new_entry) => new_entry,
                Err(e) => {
                    let _ = fs::remove_dir_all(&staging_dir);
                    return Err(e);
                }
            };
        new_entry.created_at = entry.created_at;
        new_entry.last_unlocked_at = entry.last_unlocked_at;

        // Swap ciphertext generations, then drop the plaintext.
        wipe::secure_remove_dir(&backup_dir)?;
        fs::rename(&staging_dir, &backup_dir)?;
        self.dispose_source(&source, profile_id, &entry.obfuscated_id)?;

        Ok(new_entry)
    }

    /// Securely destroy an entry's ciphertext backup.
    pub fn dispose_backup(&self, profile_id: &str, entry: &VaultEntry) -> VaultResult<()> {
        let backup_dir = self
            .paths
            .profile_vault_dir(profile_id)
            .join(&entry.backup_rel_path);
        wipe::secure_remove_dir(&backup_dir)
    }
}

fn rel_to_native(rel: &str) -> PathBuf {
    rel.split('/').collect()
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path) -> VaultResult<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(windows)]
fn create_symlink(target: &str, link: &Path) -> VaultResult<()> {
    // Windows distinguishes file and directory links; the target may not
    // exist at restore time, so default to a file link.
    std::os::windows::fs::symlink_file(target, link)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, FolderMover, Session) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = VaultPaths::at(tmp.path().join("data"));
        paths.bootstrap().unwrap();
        paths.bootstrap_profile("prof").unwrap();

        let engine = Arc::new(CryptoEngine::new().unwrap());
        let mover = FolderMover::new(engine, paths);
        let session = Session::new(
            "prof".into(),
            MasterKey::generate(),
            Duration::from_secs(900),
        );
        (tmp, mover, session)
    }

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), b"hello\n").unwrap();
        fs::write(root.join("sub/b.bin"), [0xde, 0xad, 0xbe, 0xef]).unwrap();
    }

    #[test]
    fn test_scan_sorted_and_complete() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("t");
        sample_tree(&root);

        let scan = scan_tree(&root).unwrap();
        assert_eq!(scan.dirs.len(), 1);
        assert_eq!(scan.files.len(), 2);
        assert_eq!(scan.files[0].0, "a.txt");
        assert_eq!(scan.files[1].0, "sub/b.bin");
    }

    #[test]
    fn test_tree_checksum_content_sensitive() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = CryptoEngine::new().unwrap();

        let root = tmp.path().join("t");
        sample_tree(&root);
        let c1 = tree_checksum(&engine, &scan_tree(&root).unwrap()).unwrap();

        fs::write(root.join("a.txt"), b"hello!").unwrap();
        let c2 = tree_checksum(&engine, &scan_tree(&root).unwrap()).unwrap();
        assert_ne!(c1, c2);
    }

    #[test]
    fn test_hide_disposes_source_and_obfuscates() {
        let (tmp, mover, session) = setup();
        let source = tmp.path().join("secret_tax_2024");
        sample_tree(&source);

        let entry = mover.hide(&source, &session).unwrap();
        assert!(!source.exists());
        assert_eq!(entry.state, EntryState::Locked);

        // Nothing under the backup betrays the original names.
        let backup = tmp
            .path()
            .join("data/vaults/prof")
            .join(&entry.backup_rel_path);
        for child in fs::read_dir(&backup).unwrap() {
            let name = child.unwrap().file_name().to_string_lossy().into_owned();
            assert_eq!(name.len(), 32);
            assert!(!name.contains("tax"));
            assert!(!name.contains("a.txt"));
        }
        // The flat layout hides even the existence of subdirectories.
        assert_eq!(fs::read_dir(&backup).unwrap().count(), 2);
    }

    #[test]
    fn test_hide_unhide_roundtrip() {
        let (tmp, mover, session) = setup();
        let source = tmp.path().join("project");
        sample_tree(&source);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(source.join("a.txt"), fs::Permissions::from_mode(0o640)).unwrap();
        }

        let entry = mover.hide(&source, &session).unwrap();

        // Decrypt metadata the way the manager does.
        let engine = CryptoEngine::new().unwrap();
        let nonce = hex::decode(&entry.metadata_nonce).unwrap();
        let ct = hex::decode(&entry.metadata_ciphertext).unwrap();
        let plain = engine
            .aead_decrypt(&session.metadata_key(), &nonce, entry.metadata_aad.as_bytes(), &ct)
            .unwrap();
        let meta: VaultMetadata = serde_json::from_slice(&plain).unwrap();

        let warnings = mover
            .unhide(&entry, &meta, &session, &crate::security::StaticPrivilegeProvider::none())
            .unwrap();

        assert_eq!(fs::read(source.join("a.txt")).unwrap(), b"hello\n");
        assert_eq!(fs::read(source.join("sub/b.bin")).unwrap(), [0xde, 0xad, 0xbe, 0xef]);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(source.join("a.txt")).unwrap().permissions().mode();
            assert_eq!(mode & 0o7777, 0o640);
        }

        assert!(warnings.iter().all(|w| !w.message.contains("mode")));
    }

    #[test]
    fn test_unhide_collision_rejected() {
        let (tmp, mover, session) = setup();
        let source = tmp.path().join("folder");
        sample_tree(&source);
        let entry = mover.hide(&source, &session).unwrap();

        let engine = CryptoEngine::new().unwrap();
        let nonce = hex::decode(&entry.metadata_nonce).unwrap();
        let ct = hex::decode(&entry.metadata_ciphertext).unwrap();
        let plain = engine
            .aead_decrypt(&session.metadata_key(), &nonce, entry.metadata_aad.as_bytes(), &ct)
            .unwrap();
        let meta: VaultMetadata = serde_json::from_slice(&plain).unwrap();

        // Something else now occupies the original path.
        fs::create_dir_all(&source).unwrap();
        let result = mover.unhide(
            &entry,
            &meta,
            &session,
            &crate::security::StaticPrivilegeProvider::none(),
        );
        assert!(matches!(result, Err(VaultError::AlreadyExists)));
    }

    #[test]
    fn test_tampered_blob_leaves_no_partial_restore() {
        let (tmp, mover, session) = setup();
        let source = tmp.path().join("folder");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("big.bin"), vec![0x5au8; 2 * 1024 * 1024]).unwrap();

        let entry = mover.hide(&source, &session).unwrap();

        // Flip one byte in the stored ciphertext.
        let backup = tmp
            .path()
            .join("data/vaults/prof")
            .join(&entry.backup_rel_path);
        let blob_path = fs::read_dir(&backup).unwrap().next().unwrap().unwrap().path();
        let mut blob = fs::read(&blob_path).unwrap();
        let mid = blob.len() / 2;
        blob[mid] ^= 0x01;
        fs::write(&blob_path, blob).unwrap();

        let engine = CryptoEngine::new().unwrap();
        let nonce = hex::decode(&entry.metadata_nonce).unwrap();
        let ct = hex::decode(&entry.metadata_ciphertext).unwrap();
        let plain = engine
            .aead_decrypt(&session.metadata_key(), &nonce, entry.metadata_aad.as_bytes(), &ct)
            .unwrap();
        let meta: VaultMetadata = serde_json::from_slice(&plain).unwrap();

        let result = mover.unhide(
            &entry,
            &meta,
            &session,
            &crate::security::StaticPrivilegeProvider::none(),
        );
        assert!(matches!(result, Err(VaultError::IntegrityViolation)));
        assert!(!source.exists());
    }

    #[test]
    fn test_hide_rejects_vault_internal_path() {
        let (tmp, mover, session) = setup();
        let inside = tmp.path().join("data/vaults/prof/tmp/self");
        fs::create_dir_all(&inside).unwrap();
        assert!(mover.hide(&inside, &session).is_err());
    }
}
