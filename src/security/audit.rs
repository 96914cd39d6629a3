use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use uuid::Uuid;

use crate::config::AuditSettings;
use crate::error::VaultResult;
use crate::profile::store::restrict_file_permissions;

/// Security-relevant event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    AuthFailure,
    AuthSuccess,
    RateLimitBreach,
    EncryptionFailure,
    DecryptionFailure,
    VaultCorruptionDetected,
    UnauthorizedAccess,
    ConfigChange,
    PrivilegeChange,
    RecoveryRedemption,
    InfoEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// One journal record. Description and detail values are sanitized before
/// the event is persisted or handed to any sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub kind: AuditKind,
    pub severity: Severity,
    pub profile_id: Option<String>,
    pub description: String,
    pub details: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub source_component: String,
}

/// Receiver for `Severity::Critical` events, invoked synchronously before
/// the journal write returns. Implementations decide whether to alert,
/// enqueue, or escalate.
pub trait CriticalSink: Send + Sync {
    fn on_critical(&self, event: &AuditEvent);
}

// ==================== SANITIZATION ====================

// Applied in order; the key=value pass runs first so a leaked
// `password=...` is removed before the generic runs could split it.
static RE_KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(password|passphrase|secret|token|key)\s*[=:]\s*[^\s,;]+").unwrap()
});
static RE_RECOVERY_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:[A-Z0-9]{4}-){4,}[A-Z0-9]{4}\b").unwrap());
static RE_HOME_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:/home/|/Users/|[A-Za-z]:\\Users\\)[^\s"',;]+"#).unwrap());
static RE_HEX_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[0-9a-fA-F]{32,}\b").unwrap());
static RE_B64_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9+/]{40,}={0,2}").unwrap());

/// Strip credentials, user paths, and key-shaped strings from free text.
pub fn sanitize(text: &str) -> String {
    let text = RE_KEY_VALUE.replace_all(text, "$1=[REDACTED]");
    let text = RE_RECOVERY_TOKEN.replace_all(&text, "[REDACTED_TOKEN]");
    let text = RE_HOME_PATH.replace_all(&text, "[REDACTED_PATH]");
    let text = RE_HEX_RUN.replace_all(&text, "[REDACTED_HEX]");
    let text = RE_B64_RUN.replace_all(&text, "[REDACTED_B64]");
    text.into_owned()
}

// ==================== JOURNAL ====================

struct RetentionWorker {
    handle: Option<JoinHandle<()>>,
    stop: Arc<(Mutex<bool>, Condvar)>,
}

/// Append-only journal of security events, one sanitized JSON line per
/// event, rotated by size and purged by age.
pub struct AuditLog {
    log_path: PathBuf,
    settings: AuditSettings,
    write_lock: Mutex<()>,
    critical_sink: Mutex<Option<Arc<dyn CriticalSink>>>,
    worker: Mutex<Option<RetentionWorker>>,
}

impl AuditLog {
    pub fn new(log_path: PathBuf, settings: AuditSettings) -> VaultResult<Self> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            log_path,
            settings,
            write_lock: Mutex::new(()),
            critical_sink: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Register the sink that receives critical events synchronously.
    /// Replaces any previous sink.
    pub fn register_critical_sink(&self, sink: Arc<dyn CriticalSink>) {
        if let Ok(mut guard) = self.critical_sink.lock() {
            *guard = Some(sink);
        }
    }

    /// Record an event. The description and every detail value pass the
    /// sanitizer; a critical event reaches the registered sink before this
    /// call returns.
    pub fn record(
        &self,
        kind: AuditKind,
        severity: Severity,
        profile_id: Option<&str>,
        source_component: &str,
        description: &str,
        details: BTreeMap<String, String>,
    ) {
        let event = AuditEvent {
            id: Uuid::new_v4(),
            kind,
            severity,
            profile_id: profile_id.map(String::from),
            description: sanitize(description),
            details: details
                .into_iter()
                .map(|(k, v)| (k, sanitize(&v)))
                .collect(),
            timestamp: Utc::now(),
            source_component: source_component.to_string(),
        };

        // Info never reaches the critical sink; Critical always does,
        // synchronously, before persistence.
        if event.severity == Severity::Critical {
            let sink = self.critical_sink.lock().ok().and_then(|g| g.clone());
            if let Some(sink) = sink {
                sink.on_critical(&event);
            }
        }

        if let Err(e) = self.append(&event) {
            // The journal must never take the vault down with it.
            tracing::error!("Failed to persist audit event: {}", e);
        }
    }

    pub fn info(&self, kind: AuditKind, profile_id: Option<&str>, source: &str, description: &str) {
        self.record(kind, Severity::Info, profile_id, source, description, BTreeMap::new());
    }

    pub fn warning(
        &self,
        kind: AuditKind,
        profile_id: Option<&str>,
        source: &str,
        description: &str,
    ) {
        self.record(kind, Severity::Warning, profile_id, source, description, BTreeMap::new());
    }

    pub fn critical(
        &self,
        kind: AuditKind,
        profile_id: Option<&str>,
        source: &str,
        description: &str,
    ) {
        self.record(kind, Severity::Critical, profile_id, source, description, BTreeMap::new());
    }

    fn append(&self, event: &AuditEvent) -> VaultResult<()> {
        let _guard = self.write_lock.lock();

        self.rotate_if_needed()?;

        let line = serde_json::to_string(event)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        restrict_file_permissions(&self.log_path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    fn rotate_if_needed(&self) -> VaultResult<()> {
        let Ok(md) = fs::metadata(&self.log_path) else {
            return Ok(());
        };
        if md.len() <= self.settings.max_log_bytes {
            return Ok(());
        }
        let rotated = self
            .log_path
            .with_file_name(format!("security.log.{}", Utc::now().timestamp()));
        fs::rename(&self.log_path, rotated)?;
        Ok(())
    }

    /// Events matching the filter, oldest first. Unparseable lines are
    /// counted but skipped.
    pub fn query(&self, filter: &AuditQuery) -> VaultResult<Vec<AuditEvent>> {
        let _guard = self.write_lock.lock();

        if !self.log_path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&self.log_path)?);
        let mut events = Vec::new();
        let mut skipped = 0usize;
        for line in reader.lines() {
            let line = line?;
            match serde_json::from_str::<AuditEvent>(&line) {
                Ok(event) if filter.matches(&event) => events.push(event),
                Ok(_) => {}
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!("Audit query skipped {} unparseable lines", skipped);
        }
        Ok(events)
    }

    /// Copy the journal (already sanitized at write time) to `dest`.
    pub fn export(&self, dest: &Path) -> VaultResult<u64> {
        let _guard = self.write_lock.lock();
        if !self.log_path.exists() {
            fs::write(dest, b"")?;
            return Ok(0);
        }
        let bytes = fs::copy(&self.log_path, dest)?;
        restrict_file_permissions(dest)?;
        Ok(bytes)
    }

    /// Drop events older than the retention window by rewriting the
    /// journal. Called by the periodic worker and at shutdown.
    pub fn purge_expired(&self) -> VaultResult<usize> {
        let _guard = self.write_lock.lock();

        if !self.log_path.exists() {
            return Ok(0);
        }
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(self.settings.retention_days));

        let reader = BufReader::new(fs::File::open(&self.log_path)?);
        let mut kept = Vec::new();
        let mut purged = 0usize;
        for line in reader.lines() {
            let line = line?;
            match serde_json::from_str::<AuditEvent>(&line) {
                Ok(event) if event.timestamp < cutoff => purged += 1,
                _ => kept.push(line),
            }
        }

        if purged > 0 {
            let mut contents = kept.join("\n");
            if !contents.is_empty() {
                contents.push('\n');
            }
            crate::profile::store::atomic_write(&self.log_path, contents.as_bytes())?;
        }
        Ok(purged)
    }

    /// Start the hourly retention task. Idempotent; the worker stops
    /// cooperatively on [`AuditLog::shutdown`] or drop.
    pub fn start_retention_task(self: &Arc<Self>) {
        let mut guard = match self.worker.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if guard.is_some() {
            return;
        }

        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_for_thread = Arc::clone(&stop);
        let log = Arc::clone(self);
        let interval = Duration::from_secs(self.settings.purge_interval_secs.max(1));

        let handle = std::thread::Builder::new()
            .name("audit-retention".into())
            .spawn(move || {
                let (lock, cvar) = &*stop_for_thread;
                loop {
                    let stopped = lock.lock().unwrap_or_else(|e| e.into_inner());
                    let (stopped, _) = cvar
                        .wait_timeout_while(stopped, interval, |s| !*s)
                        .unwrap_or_else(|e| e.into_inner());
                    if *stopped {
                        break;
                    }
                    drop(stopped);
                    match log.purge_expired() {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!("Audit retention purged {} events", n),
                        Err(e) => tracing::warn!("Audit retention purge failed: {}", e),
                    }
                }
            });

        if let Ok(handle) = handle {
            *guard = Some(RetentionWorker {
                handle: Some(handle),
                stop,
            });
        }
    }

    /// Stop the retention worker and wait for it to exit.
    pub fn shutdown(&self) {
        let worker = match self.worker.lock() {
            Ok(mut g) => g.take(),
            Err(_) => None,
        };
        if let Some(mut worker) = worker {
            let (lock, cvar) = &*worker.stop;
            if let Ok(mut stopped) = lock.lock() {
                *stopped = true;
            }
            cvar.notify_all();
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Filter for [`AuditLog::query`]. Empty fields match everything.
#[derive(Debug, Default, Clone)]
pub struct AuditQuery {
    pub kind: Option<AuditKind>,
    pub min_severity: Option<Severity>,
    pub profile_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AuditQuery {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(kind) = self.kind {
            if event.kind != kind {
                return false;
            }
        }
        if let Some(min) = self.min_severity {
            if event.severity < min {
                return false;
            }
        }
        if let Some(ref profile) = self.profile_id {
            if event.profile_id.as_deref() != Some(profile.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        true
    }
}
