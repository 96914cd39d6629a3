//! Public-facing vault facade. Validates the session on every call,
//! serializes operations per profile, delegates to the catalog and mover,
//! and enforces the entry lifecycle:
//!
//! ```text
//!            insert
//!      (none) ─────► Locked ──unhide(Temporary)──► TemporarilyUnlocked
//!                      ▲                                   │
//!                      └────── relock | session_end ───────┘
//!                      │
//!                      └─ unhide(Permanent) | remove ──► (none)
//! ```
//!
//! A temporarily unlocked entry can never be released directly; it must be
//! re-locked first.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::{VaultPaths, VaultSettings};
use crate::crypto::CryptoEngine;
use crate::error::{VaultError, VaultResult};
use crate::profile::Session;
use crate::security::audit::{AuditKind, AuditLog, Severity};
use crate::security::privilege::PrivilegeProvider;

use super::catalog::{IntegrityReport, VaultCatalog};
use super::entry::{EntryState, EntrySummary, VaultEntry};
use super::metadata::RestoreWarning;
use super::mover::FolderMover;

const SOURCE: &str = "vault_manager";

/// How a folder leaves the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhideMode {
    /// Restore the plaintext but keep the entry; re-locked on demand or at
    /// session end.
    Temporary,
    /// Restore and release: the entry is removed and the backup wiped.
    Permanent,
}

pub struct VaultManager {
    paths: VaultPaths,
    engine: Arc<CryptoEngine>,
    audit: Arc<AuditLog>,
    settings: VaultSettings,
    privileges: Arc<dyn PrivilegeProvider>,
    mover: FolderMover,
    profile_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VaultManager {
    pub fn new(
        paths: VaultPaths,
        engine: Arc<CryptoEngine>,
        audit: Arc<AuditLog>,
        settings: VaultSettings,
        privileges: Arc<dyn PrivilegeProvider>,
    ) -> Self {
        let mover = FolderMover::new(Arc::clone(&engine), paths.clone());
        Self {
            paths,
            engine,
            audit,
            settings,
            privileges,
            mover,
            profile_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Per-profile serialization: each profile's operations execute in
    /// program order; distinct profiles proceed in parallel.
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

    /// Every public operation starts here. An idle-expired session is
    /// refused (after re-locking, when so configured); a recovery session
    /// under the rotation policy may only change the password.
    fn guard_session(&self, session: &Session) -> VaultResult<()> {
        if session.is_expired() {
            if self.settings.session.relock_on_idle {
                if let Err(e) = self.relock_temporaries_inner(session) {
                    tracing::warn!("Idle relock sweep failed: {}", e);
                }
            }
            return Err(VaultError::SessionExpired);
        }

        if session.opened_via_recovery() && self.settings.force_rotate_recovery_after_redeem {
            self.audit.warning(
                AuditKind::UnauthorizedAccess,
                Some(session.profile_id()),
                SOURCE,
                "recovery session attempted a vault operation before password rotation",
            );
            return Err(VaultError::InvalidState);
        }

        session.touch();
        Ok(())
    }

    fn catalog(&self, session: &Session) -> VaultResult<VaultCatalog> {
        VaultCatalog::open(session.profile_id(), &self.paths)
    }

    // ==================== OPERATIONS ====================

    /// Encrypt a folder into the vault. On success the source path no
    /// longer exists and the catalog holds a `Locked` entry for it.
    pub fn hide(&self, session: &Session, folder: &Path) -> VaultResult<EntrySummary> {
        let lock = self.profile_lock(session.profile_id());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.guard_session(session)?;

        let catalog = self.catalog(session)?;

        let entry = self.mover.hide(folder, session).map_err(|e| {
            self.audit.record(
                AuditKind::EncryptionFailure,
                Severity::Error,
                Some(session.profile_id()),
                SOURCE,
                &format!("folder ingest failed: {}", e),
                Default::default(),
            );
            e
        })?;

        catalog.insert(&entry)?;

        self.audit.info(
            AuditKind::InfoEvent,
            Some(session.profile_id()),
            SOURCE,
            "folder locked into vault",
        );

        let mut summary = entry.summary();
        summary.original_path = Some(folder.to_string_lossy().into_owned());
        Ok(summary)
    }

    /// Restore a folder to its original path.
    pub fn unhide(
        &self,
        session: &Session,
        obfuscated_id: &str,
        mode: UnhideMode,
    ) -> VaultResult<()> {
        let lock = self.profile_lock(session.profile_id());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.guard_session(session)?;

        let catalog = self.catalog(session)?;
        let entry = catalog.lookup(obfuscated_id)?;

        match entry.state {
            EntryState::Locked => {}
            EntryState::Corrupted => return Err(VaultError::Corrupted),
            // TemporarilyUnlocked → (none) is a forbidden transition, and
            // transitional states mean another operation owns the entry.
            _ => return Err(VaultError::InvalidState),
        }

        let meta = match catalog.decrypt_metadata(&entry, &self.engine, &session.metadata_key()) {
            Ok(meta) => meta,
            Err(e) => {
                self.mark_corrupted(&catalog, &entry, "metadata tag verification failed");
                return Err(e);
            }
        };

        let warnings = match self.mover.unhide(&entry, &meta, session, self.privileges.as_ref()) {
            Ok(warnings) => warnings,
            Err(VaultError::IntegrityViolation) => {
                self.mark_corrupted(&catalog, &entry, "content integrity check failed");
                return Err(VaultError::IntegrityViolation);
            }
            Err(e) => {
                self.audit.record(
                    AuditKind::DecryptionFailure,
                    Severity::Error,
                    Some(session.profile_id()),
                    SOURCE,
                    &format!("restore failed: {}", e),
                    Default::default(),
                );
                return Err(e);
            }
        };
        self.report_warnings(session.profile_id(), &warnings);

        match mode {
            UnhideMode::Temporary => {
                catalog.set_state(obfuscated_id, EntryState::TemporarilyUnlocked)?;
            }
            UnhideMode::Permanent => {
                self.mover.dispose_backup(session.profile_id(), &entry)?;
                catalog.remove(obfuscated_id)?;
            }
        }

        self.audit.info(
            AuditKind::InfoEvent,
            Some(session.profile_id()),
            SOURCE,
            match mode {
                UnhideMode::Temporary => "folder temporarily unlocked",
                UnhideMode::Permanent => "folder permanently released",
            },
        );
        Ok(())
    }

    /// Re-lock one temporarily unlocked folder, re-encrypting whatever the
    /// user changed while it was visible.
    pub fn relock_temporary(&self, session: &Session, obfuscated_id: &str) -> VaultResult<()> {
        let lock = self.profile_lock(session.profile_id());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.guard_session(session)?;

        let catalog = self.catalog(session)?;
        self.relock_entry(&catalog, session, obfuscated_id)
    }

    fn relock_entry(
        &self,
        catalog: &VaultCatalog,
        session: &Session,
        obfuscated_id: &str,
    ) -> VaultResult<()> {
        let entry = catalog.lookup(obfuscated_id)?;
        if entry.state != EntryState::TemporarilyUnlocked {
            return Err(VaultError::InvalidState);
        }

        let meta = catalog.decrypt_metadata(&entry, &self.engine, &session.metadata_key())?;

        let entry = catalog.set_state(obfuscated_id, EntryState::Relocking)?;
        match self.mover.relock(&entry, &meta, session) {
            Ok(new_entry) => {
                catalog.persist(&new_entry)?;
                self.audit.info(
                    AuditKind::InfoEvent,
                    Some(session.profile_id()),
                    SOURCE,
                    "folder re-locked",
                );
                Ok(())
            }
            Err(e) => {
                // The plaintext is still in place; hand the entry back.
                catalog.set_state(obfuscated_id, EntryState::TemporarilyUnlocked)?;
                self.audit.record(
                    AuditKind::EncryptionFailure,
                    Severity::Error,
                    Some(session.profile_id()),
                    SOURCE,
                    &format!("re-lock failed: {}", e),
                    Default::default(),
                );
                Err(e)
            }
        }
    }

    /// Remove a locked entry and securely wipe its backup. The plaintext
    /// is not restored first; this destroys the vault's copy.
    pub fn remove(&self, session: &Session, obfuscated_id: &str) -> VaultResult<()> {
        let lock = self.profile_lock(session.profile_id());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.guard_session(session)?;

        let catalog = self.catalog(session)?;
        let entry = catalog.lookup(obfuscated_id)?;
        match entry.state {
            EntryState::Locked | EntryState::Corrupted => {}
            _ => return Err(VaultError::InvalidState),
        }

        catalog.set_state(obfuscated_id, EntryState::Removing)?;
        self.mover.dispose_backup(session.profile_id(), &entry)?;
        catalog.remove(obfuscated_id)?;

        self.audit.info(
            AuditKind::InfoEvent,
            Some(session.profile_id()),
            SOURCE,
            "vault entry removed",
        );
        Ok(())
    }

    /// Entry summaries, with original paths where the session can decrypt
    /// the metadata.
    pub fn list(&self, session: &Session) -> VaultResult<Vec<EntrySummary>> {
        let lock = self.profile_lock(session.profile_id());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.guard_session(session)?;

        let catalog = self.catalog(session)?;
        let metadata_key = session.metadata_key();

        Ok(catalog
            .list()?
            .iter()
            .map(|entry| {
                let mut summary = entry.summary();
                if let Ok(meta) = catalog.decrypt_metadata(entry, &self.engine, &metadata_key) {
                    summary.original_path = Some(meta.folder.original_path);
                }
                summary
            })
            .collect())
    }

    /// Sweep the profile's vault: verify every entry, quarantine orphan
    /// blobs, and mark damaged entries `Corrupted`. Corruption is fatal
    /// for the affected entry but never for the manager.
    pub fn verify_integrity(&self, session: &Session) -> VaultResult<IntegrityReport> {
        let lock = self.profile_lock(session.profile_id());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.guard_session(session)?;

        let catalog = self.catalog(session)?;
        let profile_root = self.paths.profile_vault_dir(session.profile_id());
        let report = catalog.verify(&self.engine, &session.metadata_key(), &profile_root)?;

        for id in &report.damaged_ids {
            if let Ok(entry) = catalog.lookup(id) {
                self.mark_corrupted(&catalog, &entry, "integrity sweep found damage");
            }
        }
        for path in &report.quarantined {
            self.audit.warning(
                AuditKind::VaultCorruptionDetected,
                Some(session.profile_id()),
                SOURCE,
                &format!("orphan blob quarantined: {}", path.display()),
            );
        }

        Ok(report)
    }

    /// Close a session: every temporarily unlocked folder is re-locked
    /// before the master key is zeroized by the session drop.
    pub fn end_session(&self, session: Session) -> VaultResult<()> {
        let lock = self.profile_lock(session.profile_id());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let result = self.relock_temporaries_inner(&session);
        self.audit.info(
            AuditKind::InfoEvent,
            Some(session.profile_id()),
            SOURCE,
            "session ended",
        );
        drop(session);
        result
    }

    fn relock_temporaries_inner(&self, session: &Session) -> VaultResult<()> {
        let catalog = self.catalog(session)?;
        let mut first_error = None;
        for entry in catalog.list()? {
            if entry.state != EntryState::TemporarilyUnlocked {
                continue;
            }
            if let Err(e) = self.relock_entry(&catalog, session, &entry.obfuscated_id) {
                tracing::warn!(entry = %entry.obfuscated_id, "Re-lock at session end failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn mark_corrupted(&self, catalog: &VaultCatalog, entry: &VaultEntry, reason: &str) {
        if let Err(e) = catalog.set_state(&entry.obfuscated_id, EntryState::Corrupted) {
            tracing::error!(entry = %entry.obfuscated_id, "Failed to mark entry corrupted: {}", e);
        }
        self.audit.critical(
            AuditKind::VaultCorruptionDetected,
            Some(catalog.profile_id()),
            SOURCE,
            &format!("entry marked corrupted: {}", reason),
        );
    }

    fn report_warnings(&self, profile_id: &str, warnings: &[RestoreWarning]) {
        for warning in warnings {
            self.audit.warning(
                AuditKind::InfoEvent,
                Some(profile_id),
                SOURCE,
                &format!("{}: {}", warning.rel_path, warning.message),
            );
        }
    }
}
