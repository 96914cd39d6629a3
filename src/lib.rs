//! Per-user encrypted folder vault.
//!
//! Folders are encrypted and relocated into a profile-scoped vault under
//! obfuscated identifiers, and restored on demand after password
//! authentication. A recovery token independently unwraps each profile's
//! master key. See [`PhantomVault`] for the assembled service.

pub mod config;
pub mod crypto;
pub mod error;
pub mod profile;
pub mod recovery;
pub mod security;
pub mod vault;

use std::path::PathBuf;
use std::sync::Arc;

pub use config::{VaultPaths, VaultSettings};
pub use crypto::{CryptoEngine, KdfParams};
pub use error::{VaultError, VaultResult};
pub use profile::{ProfileRegistry, Session};
pub use recovery::RecoveryService;
pub use security::{AuditLog, PrivilegeProvider, RateLimiter, StaticPrivilegeProvider};
pub use vault::{UnhideMode, VaultManager};

/// Install a `tracing` subscriber honoring `RUST_LOG`. Call once from the
/// embedding application; library code only emits events.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// The assembled vault service: crypto engine (self-tested at startup),
/// audit journal with retention, rate limiter, profile registry, recovery
/// service, and the vault manager, all sharing one data root.
pub struct PhantomVault {
    paths: VaultPaths,
    settings: VaultSettings,
    engine: Arc<CryptoEngine>,
    audit: Arc<AuditLog>,
    rate_limiter: Arc<RateLimiter>,
    registry: ProfileRegistry,
    recovery: RecoveryService,
    manager: VaultManager,
}

impl PhantomVault {
    /// Open (creating on first run) the vault at the default data root.
    pub fn open_default() -> VaultResult<Self> {
        let root = VaultPaths::default_root()?;
        Self::open(root, Arc::new(StaticPrivilegeProvider::none()))
    }

    /// Open the vault at `root` with the given privilege bridge.
    pub fn open(
        root: PathBuf,
        privileges: Arc<dyn PrivilegeProvider>,
    ) -> VaultResult<Self> {
        let paths = VaultPaths::at(root);
        paths.bootstrap()?;
        let settings = VaultSettings::load_or_init(&paths)?;
        Self::assemble(paths, settings, privileges, KdfParams::default())
    }

    /// Open with explicit settings and KDF parameters. Tests use this with
    /// floor-cost KDF parameters to stay fast.
    pub fn open_with(
        root: PathBuf,
        settings: VaultSettings,
        privileges: Arc<dyn PrivilegeProvider>,
        kdf: KdfParams,
    ) -> VaultResult<Self> {
        let paths = VaultPaths::at(root);
        paths.bootstrap()?;
        settings.save(&paths)?;
        Self::assemble(paths, settings, privileges, kdf)
    }

    fn assemble(
        paths: VaultPaths,
        settings: VaultSettings,
        privileges: Arc<dyn PrivilegeProvider>,
        kdf: KdfParams,
    ) -> VaultResult<Self> {
        // Self-test failure aborts initialization.
        let engine = Arc::new(CryptoEngine::new()?);

        let audit = Arc::new(AuditLog::new(paths.security_log(), settings.audit.clone())?);
        audit.start_retention_task();

        let rate_limiter = Arc::new(RateLimiter::new(
            settings.rate_limit.clone(),
            Arc::clone(&audit),
        ));

        let store = profile::SecretStore::new(paths.profiles_dir.clone());
        let registry = ProfileRegistry::new(
            store.clone(),
            paths.clone(),
            Arc::clone(&engine),
            Arc::clone(&audit),
            Arc::clone(&rate_limiter),
            settings.clone(),
        )
        .with_kdf_params(kdf);

        let recovery = RecoveryService::new(
            store,
            Arc::clone(&engine),
            Arc::clone(&audit),
            Arc::clone(&rate_limiter),
            settings.clone(),
        );

        let manager = VaultManager::new(
            paths.clone(),
            Arc::clone(&engine),
            Arc::clone(&audit),
            settings.clone(),
            privileges,
        );

        tracing::info!(root = ?paths.root, "Vault service initialized");
        Ok(Self {
            paths,
            settings,
            engine,
            audit,
            rate_limiter,
            registry,
            recovery,
            manager,
        })
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    pub fn settings(&self) -> &VaultSettings {
        &self.settings
    }

    pub fn engine(&self) -> &CryptoEngine {
        &self.engine
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.registry
    }

    pub fn recovery(&self) -> &RecoveryService {
        &self.recovery
    }

    pub fn vault(&self) -> &VaultManager {
        &self.manager
    }

    /// Redeem a recovery token and immediately set a new password,
    /// rotating the recovery token as well. This is the supported path out
    /// of a redeemed session under the rotation policy.
    pub fn redeem_and_reset_password(
        &self,
        token: &str,
        new_password: &str,
    ) -> VaultResult<String> {
        let session = self.recovery.redeem(token)?;
        let fresh = self
            .registry
            .rewrap(session.profile_id(), session.master_key(), new_password)?;
        Ok(fresh.display())
    }

    /// Cooperative shutdown: stops the retention worker. Sessions are
    /// owned by callers and zeroize independently.
    pub fn shutdown(&self) {
        self.audit.shutdown();
    }
}
