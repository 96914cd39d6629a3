//! Secure deletion. Plain `remove_file` frees blocks with the plaintext
//! still in them; everything leaving the vault is overwritten first.
//! Single zero pass: the threat model is offline recovery of freed blocks,
//! not magnetic-force microscopy.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::{VaultError, VaultResult};

const WIPE_BUF_SIZE: usize = 1024 * 1024;

/// Overwrite a regular file with zeros, sync, then remove it. Symlinks are
/// unlinked without following — wiping through a link could destroy a
/// target outside the vault.
pub fn secure_remove_file(path: &Path) -> VaultResult<()> {
    let md = fs::symlink_metadata(path)?;

    if md.file_type().is_symlink() {
        fs::remove_file(path)?;
        return Ok(());
    }
    if !md.file_type().is_file() {
        return Err(VaultError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }

    let len = md.len();
    {
        let mut file = match OpenOptions::new().write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                // Restored trees may carry read-only modes; lift them so
                // the overwrite can proceed.
                let mut perms = md.permissions();
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    perms.set_mode(perms.mode() | 0o200);
                }
                #[cfg(not(unix))]
                perms.set_readonly(false);
                fs::set_permissions(path, perms)?;
                OpenOptions::new().write(true).open(path)?
            }
            Err(e) => return Err(e.into()),
        };
        let buf = vec![0u8; WIPE_BUF_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(WIPE_BUF_SIZE as u64) as usize;
            file.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        file.sync_all()?;
    }

    fs::remove_file(path)?;
    Ok(())
}

/// Recursively wipe a directory tree: every regular file is overwritten
/// before unlinking, then directories are removed bottom-up.
pub fn secure_remove_dir(path: &Path) -> VaultResult<()> {
    if !path.exists() {
        return Ok(());
    }
    let md = fs::symlink_metadata(path)?;
    if md.file_type().is_symlink() {
        fs::remove_file(path)?;
        return Ok(());
    }

    for entry in WalkDir::new(path).follow_links(false).contents_first(true) {
        let entry = entry.map_err(|e| {
            VaultError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "walk failed")
            }))
        })?;
        let entry_path = entry.path();
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::remove_dir(entry_path)?;
        } else {
            secure_remove_file(entry_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("secret.txt");
        fs::write(&file, b"do not leak").unwrap();
        secure_remove_file(&file).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn test_dir_removed_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("tree");
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/x.txt"), b"one").unwrap();
        fs::write(root.join("a/b/y.txt"), b"two").unwrap();

        secure_remove_dir(&root).unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_missing_dir_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        secure_remove_dir(&tmp.path().join("absent")).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_target_survives() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("target.txt");
        fs::write(&target, b"keep me").unwrap();

        let root = tmp.path().join("tree");
        fs::create_dir(&root).unwrap();
        std::os::unix::fs::symlink(&target, root.join("link")).unwrap();

        secure_remove_dir(&root).unwrap();
        assert!(!root.exists());
        assert_eq!(fs::read(&target).unwrap(), b"keep me");
    }

    #[test]
    fn test_non_regular_file_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("d");
        fs::create_dir(&dir).unwrap();
        assert!(secure_remove_file(&dir).is_err());
    }
}
