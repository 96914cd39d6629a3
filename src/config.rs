use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{VaultError, VaultResult};

/// Rate-limit policy for authentication attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    15 * 60
}

fn default_lockout_secs() -> u64 {
    60 * 60
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            window_secs: default_window_secs(),
            lockout_secs: default_lockout_secs(),
        }
    }
}

/// Audit journal policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSettings {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Rotate `security.log` once it grows past this size.
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: u64,

    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

fn default_retention_days() -> u32 {
    7
}

fn default_max_log_bytes() -> u64 {
    32 * 1024 * 1024
}

fn default_purge_interval_secs() -> u64 {
    60 * 60
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            max_log_bytes: default_max_log_bytes(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

/// Session lifetime policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Idle period after which the session master key is auto-zeroized.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Re-lock temporarily unlocked folders when the session expires idle,
    /// not only on explicit session end.
    #[serde(default = "default_true")]
    pub relock_on_idle: bool,
}

fn default_idle_timeout_secs() -> u64 {
    15 * 60
}

fn default_true() -> bool {
    true
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            relock_on_idle: true,
        }
    }
}

/// Service settings persisted as TOML at `<root>/settings.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSettings {
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default)]
    pub audit: AuditSettings,

    #[serde(default)]
    pub session: SessionSettings,

    /// After a successful recovery redemption, refuse further vault
    /// operations until the password has been changed.
    #[serde(default = "default_true")]
    pub force_rotate_recovery_after_redeem: bool,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitSettings::default(),
            audit: AuditSettings::default(),
            session: SessionSettings::default(),
            force_rotate_recovery_after_redeem: default_true(),
        }
    }
}

/// Resolved locations of everything under the data root.
#[derive(Debug, Clone)]
pub struct VaultPaths {
    pub root: PathBuf,
    pub profiles_dir: PathBuf,
    pub vaults_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub settings_file: PathBuf,
}

impl VaultPaths {
    /// Default data root, `$HOME/.phantomvault` or the platform equivalent.
    pub fn default_root() -> VaultResult<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| {
            VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not determine home directory",
            ))
        })?;
        Ok(home.join(".phantomvault"))
    }

    pub fn at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            profiles_dir: root.join("profiles"),
            vaults_dir: root.join("vaults"),
            logs_dir: root.join("logs"),
            settings_file: root.join("settings.toml"),
            root,
        }
    }

    /// Per-profile directories under `vaults/<profile_id>/`.
    pub fn profile_vault_dir(&self, profile_id: &str) -> PathBuf {
        self.vaults_dir.join(profile_id)
    }

    pub fn catalog_dir(&self, profile_id: &str) -> PathBuf {
        self.profile_vault_dir(profile_id).join("catalog")
    }

    pub fn blobs_dir(&self, profile_id: &str) -> PathBuf {
        self.profile_vault_dir(profile_id).join("blobs")
    }

    pub fn quarantine_dir(&self, profile_id: &str) -> PathBuf {
        self.profile_vault_dir(profile_id).join("quarantine")
    }

    pub fn tmp_dir(&self, profile_id: &str) -> PathBuf {
        self.profile_vault_dir(profile_id).join("tmp")
    }

    pub fn security_log(&self) -> PathBuf {
        self.logs_dir.join("security.log")
    }

    /// Create the directory skeleton. The root and everything under it is
    /// owner-only.
    pub fn bootstrap(&self) -> VaultResult<()> {
        for dir in [&self.root, &self.profiles_dir, &self.vaults_dir, &self.logs_dir] {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
                tracing::info!("Created vault directory at {:?}", dir);
            }
            restrict_dir_permissions(dir)?;
        }
        Ok(())
    }

    /// Create (and restrict) the per-profile vault subtree.
    pub fn bootstrap_profile(&self, profile_id: &str) -> VaultResult<()> {
        for dir in [
            self.profile_vault_dir(profile_id),
            self.catalog_dir(profile_id),
            self.blobs_dir(profile_id),
            self.quarantine_dir(profile_id),
            self.tmp_dir(profile_id),
        ] {
            if !dir.exists() {
                fs::create_dir_all(&dir)?;
            }
            restrict_dir_permissions(&dir)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
pub fn restrict_dir_permissions(path: &Path) -> VaultResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn restrict_dir_permissions(_path: &Path) -> VaultResult<()> {
    // Windows: directories under the user profile already carry an
    // owner-only ACL inherited from %USERPROFILE%.
    Ok(())
}

impl VaultSettings {
    /// Load settings from `<root>/settings.toml`, writing defaults on first run.
    pub fn load_or_init(paths: &VaultPaths) -> VaultResult<Self> {
        if !paths.settings_file.exists() {
            let settings = Self::default();
            settings.save(paths)?;
            return Ok(settings);
        }

        let content = fs::read_to_string(&paths.settings_file)?;
        let settings: Self = toml::from_str(&content)
            .map_err(|e| VaultError::Serialization(format!("settings parse failed: {}", e)))?;
        Ok(settings)
    }

    pub fn save(&self, paths: &VaultPaths) -> VaultResult<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| VaultError::Serialization(format!("settings serialize failed: {}", e)))?;
        crate::profile::store::atomic_write(&paths.settings_file, toml_string.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let s = VaultSettings::default();
        assert_eq!(s.rate_limit.max_attempts, 5);
        assert_eq!(s.rate_limit.window_secs, 900);
        assert_eq!(s.rate_limit.lockout_secs, 3600);
        assert_eq!(s.audit.retention_days, 7);
        assert_eq!(s.session.idle_timeout_secs, 900);
        assert!(s.session.relock_on_idle);
        assert!(s.force_rotate_recovery_after_redeem);
    }

    #[test]
    fn test_settings_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = VaultPaths::at(tmp.path().join("data"));
        paths.bootstrap().unwrap();

        let loaded = VaultSettings::load_or_init(&paths).unwrap();
        assert_eq!(loaded.rate_limit.max_attempts, 5);
        assert!(paths.settings_file.exists());

        // Second load reads the persisted file.
        let again = VaultSettings::load_or_init(&paths).unwrap();
        assert_eq!(again.audit.retention_days, loaded.audit.retention_days);
    }

    #[test]
    fn test_paths_layout() {
        let paths = VaultPaths::at("/data/pv");
        assert_eq!(paths.catalog_dir("p1"), PathBuf::from("/data/pv/vaults/p1/catalog"));
        assert_eq!(paths.blobs_dir("p1"), PathBuf::from("/data/pv/vaults/p1/blobs"));
        assert_eq!(paths.security_log(), PathBuf::from("/data/pv/logs/security.log"));
    }

    #[cfg(unix)]
    #[test]
    fn test_root_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let paths = VaultPaths::at(tmp.path().join("data"));
        paths.bootstrap().unwrap();
        let mode = std::fs::metadata(&paths.root).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
