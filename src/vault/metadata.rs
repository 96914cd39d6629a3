//! Filesystem metadata capture and restore.
//!
//! Portable semantic fields are represented directly; anything that only
//! round-trips on the same OS travels in opaque per-node attribute fields.
//! Restore order is fixed: ownership, then mode, then extended attributes,
//! then timestamps — timestamps go last because every earlier step updates
//! mtime.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::VaultResult;
use crate::security::privilege::{Capability, PrivilegeProvider};

/// Extended attribute, value hex-encoded for JSON transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct XattrPair {
    pub name: String,
    pub value_hex: String,
}

/// Per-node metadata captured at hide time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMeta {
    /// POSIX permission bits.
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,

    pub atime_s: i64,
    pub atime_ns: u32,
    pub mtime_s: i64,
    pub mtime_ns: u32,

    #[serde(default)]
    pub xattrs: Vec<XattrPair>,

    /// Windows file attribute bits (HIDDEN, SYSTEM, READONLY, ...).
    /// Captured and restored on Windows, carried opaquely elsewhere.
    pub file_attributes: Option<u32>,
}

/// Metadata of the hidden folder itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderMetadata {
    pub original_path: String,
    pub was_dot_hidden: bool,
    /// Change time at capture. Not restorable on any platform; kept for
    /// auditing and forensics.
    pub ctime_s: i64,
    pub root: NodeMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeDir {
    pub rel_path: String,
    pub meta: NodeMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeFile {
    pub rel_path: String,
    /// Obfuscated blob file name inside the entry's backup directory.
    pub blob_name: String,
    pub size: u64,
    pub meta: NodeMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSymlink {
    pub rel_path: String,
    pub target: String,
}

/// The directory structure of a hidden folder. Lives only inside the
/// encrypted metadata blob; the on-disk blob layout is a flat set of
/// opaque names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeManifest {
    pub dirs: Vec<TreeDir>,
    pub files: Vec<TreeFile>,
    pub symlinks: Vec<TreeSymlink>,
}

/// Everything the vault must know to restore a folder, AEAD-encrypted as
/// one blob under the session's metadata key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultMetadata {
    pub folder: FolderMetadata,
    pub tree: TreeManifest,
}

/// A field that was captured but could not be restored. Surfaced as a
/// WARNING audit event by the caller, never dropped silently.
#[derive(Debug, Clone)]
pub struct RestoreWarning {
    pub rel_path: String,
    pub message: String,
}

// ==================== CAPTURE ====================

#[cfg(unix)]
pub fn capture_node(path: &Path) -> VaultResult<NodeMeta> {
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::fs::PermissionsExt;

    let md = std::fs::symlink_metadata(path)?;
    let mut meta = NodeMeta {
        mode: Some(md.permissions().mode() & 0o7777),
        uid: Some(md.uid()),
        gid: Some(md.gid()),
        atime_s: md.atime(),
        atime_ns: md.atime_nsec() as u32,
        mtime_s: md.mtime(),
        mtime_ns: md.mtime_nsec() as u32,
        xattrs: Vec::new(),
        file_attributes: None,
    };

    // Extended attributes are best-effort on capture: a filesystem that
    // does not support them just yields none.
    if let Ok(names) = xattr::list(path) {
        for name in names {
            let name_str = name.to_string_lossy().into_owned();
            if let Ok(Some(value)) = xattr::get(path, &name) {
                meta.xattrs.push(XattrPair {
                    name: name_str,
                    value_hex: hex::encode(value),
                });
            }
        }
    }

    Ok(meta)
}

#[cfg(windows)]
pub fn capture_node(path: &Path) -> VaultResult<NodeMeta> {
    use std::os::windows::fs::MetadataExt;

    let md = std::fs::symlink_metadata(path)?;
    let mtime = filetime::FileTime::from_last_modification_time(&md);
    let atime = filetime::FileTime::from_last_access_time(&md);

    Ok(NodeMeta {
        mode: None,
        uid: None,
        gid: None,
        atime_s: atime.unix_seconds(),
        atime_ns: atime.nanoseconds(),
        mtime_s: mtime.unix_seconds(),
        mtime_ns: mtime.nanoseconds(),
        xattrs: Vec::new(),
        file_attributes: Some(md.file_attributes()),
    })
}

#[cfg(unix)]
fn capture_ctime(path: &Path) -> VaultResult<i64> {
    use std::os::unix::fs::MetadataExt;
    Ok(std::fs::symlink_metadata(path)?.ctime())
}

#[cfg(windows)]
fn capture_ctime(path: &Path) -> VaultResult<i64> {
    let md = std::fs::symlink_metadata(path)?;
    Ok(filetime::FileTime::from_creation_time(&md)
        .map(|t| t.unix_seconds())
        .unwrap_or(0))
}

/// Capture the metadata of the folder being hidden.
pub fn capture_folder(path: &Path) -> VaultResult<FolderMetadata> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(FolderMetadata {
        original_path: path.to_string_lossy().into_owned(),
        was_dot_hidden: name.starts_with('.'),
        ctime_s: capture_ctime(path)?,
        root: capture_node(path)?,
    })
}

// ==================== RESTORE ====================

/// Apply captured metadata to a restored node. Returns warnings for every
/// field that could not be restored; the caller turns them into audit
/// events. Ordering inside this function is load-bearing (see module docs).
pub fn apply_node(
    path: &Path,
    meta: &NodeMeta,
    rel_path: &str,
    privileges: &dyn PrivilegeProvider,
) -> Vec<RestoreWarning> {
    let mut warnings = Vec::new();

    apply_ownership(path, meta, rel_path, privileges, &mut warnings);
    apply_mode(path, meta, rel_path, &mut warnings);
    apply_xattrs(path, meta, rel_path, &mut warnings);
    apply_attributes(path, meta, rel_path, &mut warnings);

    // Timestamps last: everything above touches mtime.
    let atime = filetime::FileTime::from_unix_time(meta.atime_s, meta.atime_ns);
    let mtime = filetime::FileTime::from_unix_time(meta.mtime_s, meta.mtime_ns);
    if let Err(e) = filetime::set_file_times(path, atime, mtime) {
        warnings.push(RestoreWarning {
            rel_path: rel_path.to_string(),
            message: format!("timestamps not restored: {}", e),
        });
    }

    warnings
}

#[cfg(unix)]
fn apply_ownership(
    path: &Path,
    meta: &NodeMeta,
    rel_path: &str,
    privileges: &dyn PrivilegeProvider,
    warnings: &mut Vec<RestoreWarning>,
) {
    let (Some(uid), Some(gid)) = (meta.uid, meta.gid) else {
        return;
    };

    // Restoring to the current user succeeds unprivileged; anything else
    // needs the elevation seam.
    match std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            let held = privileges.holds(Capability::RestoreOwnership)
                || privileges.request(Capability::RestoreOwnership);
            if !held {
                warnings.push(RestoreWarning {
                    rel_path: rel_path.to_string(),
                    message: "ownership not restored: privilege unavailable".into(),
                });
                return;
            }
            if let Err(e) = std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
                warnings.push(RestoreWarning {
                    rel_path: rel_path.to_string(),
                    message: format!("ownership not restored: {}", e),
                });
            }
        }
        Err(e) => warnings.push(RestoreWarning {
            rel_path: rel_path.to_string(),
            message: format!("ownership not restored: {}", e),
        }),
    }
}

#[cfg(not(unix))]
fn apply_ownership(
    _path: &Path,
    meta: &NodeMeta,
    rel_path: &str,
    _privileges: &dyn PrivilegeProvider,
    warnings: &mut Vec<RestoreWarning>,
) {
    if meta.uid.is_some() || meta.gid.is_some() {
        warnings.push(RestoreWarning {
            rel_path: rel_path.to_string(),
            message: "POSIX ownership not applicable on this platform".into(),
        });
    }
}

#[cfg(unix)]
fn apply_mode(path: &Path, meta: &NodeMeta, rel_path: &str, warnings: &mut Vec<RestoreWarning>) {
    use std::os::unix::fs::PermissionsExt;
    let Some(mode) = meta.mode else {
        return;
    };
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        warnings.push(RestoreWarning {
            rel_path: rel_path.to_string(),
            message: format!("mode not restored: {}", e),
        });
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, meta: &NodeMeta, rel_path: &str, warnings: &mut Vec<RestoreWarning>) {
    if meta.mode.is_some() {
        warnings.push(RestoreWarning {
            rel_path: rel_path.to_string(),
            message: "POSIX mode not applicable on this platform".into(),
        });
    }
}

#[cfg(unix)]
fn apply_xattrs(path: &Path, meta: &NodeMeta, rel_path: &str, warnings: &mut Vec<RestoreWarning>) {
    for pair in &meta.xattrs {
        let Ok(value) = hex::decode(&pair.value_hex) else {
            warnings.push(RestoreWarning {
                rel_path: rel_path.to_string(),
                message: format!("xattr {} value undecodable", pair.name),
            });
            continue;
        };
        if let Err(e) = xattr::set(path, &pair.name, &value) {
            warnings.push(RestoreWarning {
                rel_path: rel_path.to_string(),
                message: format!("xattr {} not restored: {}", pair.name, e),
            });
        }
    }
}

#[cfg(not(unix))]
fn apply_xattrs(_path: &Path, meta: &NodeMeta, rel_path: &str, warnings: &mut Vec<RestoreWarning>) {
    if !meta.xattrs.is_empty() {
        warnings.push(RestoreWarning {
            rel_path: rel_path.to_string(),
            message: "extended attributes not applicable on this platform".into(),
        });
    }
}

#[cfg(windows)]
fn apply_attributes(
    path: &Path,
    meta: &NodeMeta,
    rel_path: &str,
    warnings: &mut Vec<RestoreWarning>,
) {
    // Alternate data streams are out of scope for v1; attribute bits are
    // restored via the readonly flag, the rest is reported.
    if let Some(attrs) = meta.file_attributes {
        const FILE_ATTRIBUTE_READONLY: u32 = 0x1;
        let readonly = attrs & FILE_ATTRIBUTE_READONLY != 0;
        match std::fs::metadata(path) {
            Ok(md) => {
                let mut perms = md.permissions();
                perms.set_readonly(readonly);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    warnings.push(RestoreWarning {
                        rel_path: rel_path.to_string(),
                        message: format!("attributes not restored: {}", e),
                    });
                }
            }
            Err(e) => warnings.push(RestoreWarning {
                rel_path: rel_path.to_string(),
                message: format!("attributes not restored: {}", e),
            }),
        }
        if attrs & !FILE_ATTRIBUTE_READONLY != 0 {
            warnings.push(RestoreWarning {
                rel_path: rel_path.to_string(),
                message: "non-readonly attribute bits not restored".into(),
            });
        }
    }
}

#[cfg(not(windows))]
fn apply_attributes(
    _path: &Path,
    meta: &NodeMeta,
    rel_path: &str,
    warnings: &mut Vec<RestoreWarning>,
) {
    if meta.file_attributes.is_some() {
        warnings.push(RestoreWarning {
            rel_path: rel_path.to_string(),
            message: "Windows file attributes not applicable on this platform".into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::privilege::StaticPrivilegeProvider;

    #[test]
    fn test_capture_folder_basics() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".hidden_project");
        std::fs::create_dir(&dir).unwrap();

        let folder = capture_folder(&dir).unwrap();
        assert!(folder.was_dot_hidden);
        assert!(folder.original_path.ends_with(".hidden_project"));
    }

    #[cfg(unix)]
    #[test]
    fn test_capture_mode_and_owner() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f.txt");
        std::fs::write(&file, b"x").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o640)).unwrap();

        let meta = capture_node(&file).unwrap();
        assert_eq!(meta.mode, Some(0o640));
        assert!(meta.uid.is_some());
        assert!(meta.gid.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_apply_restores_mode_and_times() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.txt");
        std::fs::write(&src, b"x").unwrap();
        std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o604)).unwrap();
        let meta = capture_node(&src).unwrap();

        let dst = tmp.path().join("dst.txt");
        std::fs::write(&dst, b"x").unwrap();
        let warnings = apply_node(&dst, &meta, "dst.txt", &StaticPrivilegeProvider::none());

        let restored = std::fs::metadata(&dst).unwrap();
        assert_eq!(restored.permissions().mode() & 0o7777, 0o604);

        use std::os::unix::fs::MetadataExt;
        assert_eq!(restored.mtime(), meta.mtime_s);

        // Same-user restore should not warn about ownership.
        assert!(warnings.iter().all(|w| !w.message.contains("ownership")));
    }

    #[test]
    fn test_manifest_roundtrip() {
        let manifest = VaultMetadata {
            folder: FolderMetadata {
                original_path: "/data/project".into(),
                was_dot_hidden: false,
                ctime_s: 12345,
                root: NodeMeta::default(),
            },
            tree: TreeManifest {
                dirs: vec![TreeDir {
                    rel_path: "sub".into(),
                    meta: NodeMeta::default(),
                }],
                files: vec![TreeFile {
                    rel_path: "sub/b.bin".into(),
                    blob_name: "ab".repeat(16),
                    size: 4,
                    meta: NodeMeta::default(),
                }],
                symlinks: vec![],
            },
        };

        let json = serde_json::to_vec(&manifest).unwrap();
        let parsed: VaultMetadata = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed.tree.files[0].rel_path, "sub/b.bin");
        assert_eq!(parsed.folder.original_path, "/data/project");
    }
}
