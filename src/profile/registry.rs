use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zeroize::Zeroizing;

use crate::config::{VaultPaths, VaultSettings};
use crate::crypto::{CryptoEngine, KdfParams, MasterKey};
use crate::error::{VaultError, VaultResult};
use crate::recovery::{build_recovery_block, RecoveryToken};
use crate::security::audit::{AuditKind, AuditLog};
use crate::security::rate_limiter::{RateLimitDecision, RateLimiter};
use crate::vault::wipe;

use super::record::{AuthBlock, ProfileRecord, ProfileSummary, WrapBlock, PROFILE_SCHEMA_VERSION};
use super::session::Session;
use super::store::SecretStore;

const SOURCE: &str = "profile_registry";

/// Creates, authenticates, and maintains profiles. Owns the verifier and
/// both wraps of each profile's master key.
pub struct ProfileRegistry {
    store: SecretStore,
    paths: VaultPaths,
    engine: Arc<CryptoEngine>,
    audit: Arc<AuditLog>,
    rate_limiter: Arc<RateLimiter>,
    settings: VaultSettings,
    kdf: KdfParams,
    profile_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProfileRegistry {
    pub fn new(
        store: SecretStore,
        paths: VaultPaths,
        engine: Arc<CryptoEngine>,
        audit: Arc<AuditLog>,
        rate_limiter: Arc<RateLimiter>,
        settings: VaultSettings,
    ) -> Self {
        Self {
            store,
            paths,
            engine,
            audit,
            rate_limiter,
            settings,
            kdf: KdfParams::default(),
            profile_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Credential operations on one profile execute in program order;
    /// distinct profiles proceed in parallel.
    fn profile_lock(&self, profile_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .profile_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(profile_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Override the KDF cost parameters for newly created records. Existing
    /// records keep the parameters they were written with.
    pub fn with_kdf_params(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn store(&self) -> &SecretStore {
        &self.store
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.session.idle_timeout_secs)
    }

    // ==================== CREATE ====================

    /// Create a profile. Returns the new profile id and the one-time
    /// display form of its recovery token.
    pub fn create(&self, name: &str, password: &str) -> VaultResult<(String, String)> {
        if name.trim().is_empty() || password.is_empty() {
            return Err(VaultError::InvalidState);
        }

        let profile_id = hex::encode(self.engine.new_opaque_id()?);
        let master = MasterKey::generate();

        let (auth, data) = self.credential_blocks(&profile_id, password, &master)?;
        let (recovery, token) =
            build_recovery_block(&self.engine, &self.kdf, &profile_id, &master)?;

        let now = Utc::now();
        let record = ProfileRecord {
            schema_version: PROFILE_SCHEMA_VERSION,
            id: profile_id.clone(),
            name: name.trim().to_string(),
            created_at: now,
            last_access_at: now,
            kdf: self.kdf,
            auth,
            data,
            recovery,
        };

        self.store.save(&record)?;
        self.paths.bootstrap_profile(&profile_id)?;

        self.audit.info(
            AuditKind::ConfigChange,
            Some(&profile_id),
            SOURCE,
            "profile created",
        );
        tracing::info!(profile = %profile_id, "Created profile");

        Ok((profile_id, token.display()))
    }

    /// Derive the authentication verifier and the password wrap of the
    /// master key, each under a fresh salt.
    fn credential_blocks(
        &self,
        profile_id: &str,
        password: &str,
        master: &MasterKey,
    ) -> VaultResult<(AuthBlock, WrapBlock)> {
        let auth_salt = self.engine.random_bytes(self.kdf.salt_len)?;
        let verifier = self
            .engine
            .derive_key(password.as_bytes(), &auth_salt, &self.kdf)?;

        let data_salt = self.engine.random_bytes(self.kdf.salt_len)?;
        let wrap_key = self
            .engine
            .derive_aead_key(password.as_bytes(), &data_salt, &self.kdf)?;
        let nonce = self.engine.new_nonce()?;
        let aad = ProfileRecord::password_aad(profile_id);
        let wrapped = self
            .engine
            .aead_encrypt(&wrap_key, &nonce, aad.as_bytes(), master.as_bytes())?;

        Ok((
            AuthBlock {
                salt: hex::encode(&auth_salt),
                verifier: hex::encode(verifier.as_slice()),
            },
            WrapBlock {
                salt: hex::encode(&data_salt),
                master_wrapped: hex::encode(wrapped),
                nonce: hex::encode(nonce),
                aad,
            },
        ))
    }

    // ==================== AUTHENTICATE ====================

    /// Authenticate and open a session holding the unwrapped master key.
    /// Unknown profile and wrong password are indistinguishable; both burn
    /// a KDF derivation and both count against the rate limiter.
    pub fn authenticate(&self, profile_id: &str, password: &str) -> VaultResult<Session> {
        let lock = self.profile_lock(profile_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.authenticate_inner(profile_id, password)
    }

    fn authenticate_inner(&self, profile_id: &str, password: &str) -> VaultResult<Session> {
        if self.rate_limiter.check(profile_id) == RateLimitDecision::Denied {
            return Err(VaultError::RateLimited);
        }

        let record = match self.store.load(profile_id) {
            Ok(record) => record,
            Err(VaultError::NotFound) => {
                self.burn_kdf(password);
                return self.auth_failure(profile_id, "unknown profile");
            }
            Err(e) => return Err(e),
        };

        let auth_salt = hex::decode(&record.auth.salt).map_err(|_| VaultError::Corrupted)?;
        let stored_verifier =
            hex::decode(&record.auth.verifier).map_err(|_| VaultError::Corrupted)?;

        let candidate = self
            .engine
            .derive_key(password.as_bytes(), &auth_salt, &record.kdf)?;
        if !self.engine.ct_eq(&candidate, &stored_verifier) {
            return self.auth_failure(profile_id, "verifier mismatch");
        }

        let master = self.unwrap_master(&record, password)?;

        self.rate_limiter.reset(profile_id);
        self.touch_last_access(record)?;

        self.audit.info(
            AuditKind::AuthSuccess,
            Some(profile_id),
            SOURCE,
            "password authentication succeeded",
        );

        Ok(Session::new(
            profile_id.to_string(),
            master,
            self.idle_timeout(),
        ))
    }

    fn auth_failure(&self, profile_id: &str, internal_reason: &str) -> VaultResult<Session> {
        self.rate_limiter.record_failure(profile_id);
        self.audit.warning(
            AuditKind::AuthFailure,
            Some(profile_id),
            SOURCE,
            &format!("authentication failed: {}", internal_reason),
        );
        Err(VaultError::AuthenticationFailed)
    }

    /// Equalize the cost of probing an id that does not exist.
    fn burn_kdf(&self, password: &str) {
        let salt = [0x55u8; 16];
        let _ = self.engine.derive_key(password.as_bytes(), &salt, &KdfParams::floor());
    }

    fn unwrap_master(&self, record: &ProfileRecord, password: &str) -> VaultResult<MasterKey> {
        let data_salt = hex::decode(&record.data.salt).map_err(|_| VaultError::Corrupted)?;
        let nonce = hex::decode(&record.data.nonce).map_err(|_| VaultError::Corrupted)?;
        let wrapped =
            hex::decode(&record.data.master_wrapped).map_err(|_| VaultError::Corrupted)?;

        let wrap_key = self
            .engine
            .derive_aead_key(password.as_bytes(), &data_salt, &record.kdf)?;

        let master_bytes: Zeroizing<Vec<u8>> = self
            .engine
            .aead_decrypt(&wrap_key, &nonce, record.data.aad.as_bytes(), &wrapped)
            .map(Zeroizing::new)
            .map_err(|_| {
                // The verifier matched but the wrap will not open: the
                // record is damaged, not the password.
                self.audit.critical(
                    AuditKind::VaultCorruptionDetected,
                    Some(&record.id),
                    SOURCE,
                    "verifier matched but master key unwrap failed",
                );
                VaultError::Corrupted
            })?;

        MasterKey::from_bytes(&master_bytes).ok_or(VaultError::Corrupted)
    }

    fn touch_last_access(&self, mut record: ProfileRecord) -> VaultResult<()> {
        record.last_access_at = Utc::now();
        self.store.save(&record)
    }

    // ==================== CHANGE PASSWORD ====================

    /// Change the password. Every salt is refreshed and a new recovery
    /// token is issued; the previous token stops redeeming because the
    /// recovery salt it was bound to no longer exists. The record is
    /// replaced in a single atomic rename, so a failure at any earlier
    /// step leaves the old credentials fully intact.
    pub fn change_password(
        &self,
        profile_id: &str,
        old_password: &str,
        new_password: &str,
    ) -> VaultResult<String> {
        if new_password.is_empty() {
            return Err(VaultError::InvalidState);
        }

        let lock = self.profile_lock(profile_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let session = self.authenticate_inner(profile_id, old_password)?;
        let token = self.rewrap_inner(profile_id, session.master_key(), new_password)?;

        self.audit.info(
            AuditKind::ConfigChange,
            Some(profile_id),
            SOURCE,
            "password changed, recovery token rotated",
        );
        Ok(token.display())
    }

    /// Rewrap the master key under a new password, producing a fresh
    /// recovery token. Used by `change_password` and by recovery-driven
    /// resets where the old password is unavailable.
    pub fn rewrap(
        &self,
        profile_id: &str,
        master: &MasterKey,
        new_password: &str,
    ) -> VaultResult<RecoveryToken> {
        let lock = self.profile_lock(profile_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.rewrap_inner(profile_id, master, new_password)
    }

    fn rewrap_inner(
        &self,
        profile_id: &str,
        master: &MasterKey,
        new_password: &str,
    ) -> VaultResult<RecoveryToken> {
        let mut record = self.store.load(profile_id)?;

        let (auth, data) = self.credential_blocks(profile_id, new_password, master)?;
        let (recovery, token) = build_recovery_block(&self.engine, &self.kdf, profile_id, master)?;

        record.kdf = self.kdf;
        record.auth = auth;
        record.data = data;
        record.recovery = recovery;
        record.last_access_at = Utc::now();

        self.store.save(&record)?;
        Ok(token)
    }

    // ==================== DELETE / LIST ====================

    /// Delete a profile after authenticating. The record file is
    /// overwritten before removal and the profile's vault directory is
    /// securely wiped.
    pub fn delete(&self, profile_id: &str, password: &str) -> VaultResult<()> {
        let lock = self.profile_lock(profile_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let _session = self.authenticate_inner(profile_id, password)?;

        self.store.wipe(profile_id)?;

        let vault_dir = self.paths.profile_vault_dir(profile_id);
        if vault_dir.exists() {
            wipe::secure_remove_dir(&vault_dir)?;
        }

        self.audit.info(
            AuditKind::ConfigChange,
            Some(profile_id),
            SOURCE,
            "profile deleted",
        );
        tracing::info!(profile = %profile_id, "Deleted profile");
        Ok(())
    }

    pub fn list(&self) -> VaultResult<Vec<ProfileSummary>> {
        Ok(self
            .store
            .load_all()?
            .iter()
            .map(ProfileRecord::summary)
            .collect())
    }
}
