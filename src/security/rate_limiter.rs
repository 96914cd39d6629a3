use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::RateLimitSettings;

use super::audit::{AuditKind, AuditLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Denied,
}

/// Point-in-time view of one identifier's window.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub identifier: String,
    pub attempt_count: u32,
    pub window_start: Option<DateTime<Utc>>,
    pub locked: bool,
    pub lockout_until: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    attempt_count: u32,
    lockout_until: Option<Instant>,
}

/// Sliding-window attempt counter with lockout, keyed by an opaque
/// identifier (profile id, or a fixed tag for global gates). Failures are
/// counted explicitly by the caller after an authentication attempt;
/// `check` only gates.
pub struct RateLimiter {
    settings: RateLimitSettings,
    state: Mutex<HashMap<String, WindowState>>,
    audit: Arc<AuditLog>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings, audit: Arc<AuditLog>) -> Self {
        Self {
            settings,
            state: Mutex::new(HashMap::new()),
            audit,
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.settings.window_secs)
    }

    fn lockout(&self) -> Duration {
        Duration::from_secs(self.settings.lockout_secs)
    }

    /// Gate an attempt. Does not count; call [`RateLimiter::record_failure`]
    /// after a failed attempt.
    pub fn check(&self, identifier: &str) -> RateLimitDecision {
        enum Verdict {
            Allow,
            Deny,
            /// Lockout or window elapsed; the identifier starts over.
            Expire,
        }

        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => return self.fail_open(identifier),
        };

        let now = Instant::now();
        let verdict = match state.get(identifier) {
            None => Verdict::Allow,
            Some(entry) => {
                if let Some(until) = entry.lockout_until {
                    if now < until {
                        Verdict::Deny
                    } else {
                        Verdict::Expire
                    }
                } else if now.duration_since(entry.window_start) > self.window() {
                    Verdict::Expire
                } else if entry.attempt_count >= self.settings.max_attempts {
                    Verdict::Deny
                } else {
                    Verdict::Allow
                }
            }
        };

        match verdict {
            Verdict::Allow => RateLimitDecision::Allowed,
            Verdict::Deny => RateLimitDecision::Denied,
            Verdict::Expire => {
                state.remove(identifier);
                RateLimitDecision::Allowed
            }
        }
    }

    /// Count a failed attempt. Returns `true` when this failure breached
    /// the policy and triggered the lockout.
    pub fn record_failure(&self, identifier: &str) -> bool {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.fail_open(identifier);
                return false;
            }
        };

        let now = Instant::now();
        let entry = state.entry(identifier.to_string()).or_insert(WindowState {
            window_start: now,
            attempt_count: 0,
            lockout_until: None,
        });

        if entry.lockout_until.is_none() && now.duration_since(entry.window_start) > self.window()
        {
            entry.window_start = now;
            entry.attempt_count = 0;
        }

        entry.attempt_count += 1;

        if entry.lockout_until.is_none() && entry.attempt_count >= self.settings.max_attempts {
            entry.lockout_until = Some(now + self.lockout());
            self.audit.record(
                AuditKind::RateLimitBreach,
                super::audit::Severity::Warning,
                Some(identifier),
                "rate_limiter",
                "attempt limit breached, identifier locked out",
                Default::default(),
            );
            return true;
        }
        false
    }

    /// Clear an identifier, e.g. after a successful authentication or from
    /// an administrative unlock.
    pub fn reset(&self, identifier: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.remove(identifier);
        }
    }

    pub fn info(&self, identifier: &str) -> RateLimitInfo {
        let state = match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => {
                return RateLimitInfo {
                    identifier: identifier.to_string(),
                    attempt_count: 0,
                    window_start: None,
                    locked: false,
                    lockout_until: None,
                }
            }
        };

        let now_instant = Instant::now();
        let now_utc = Utc::now();
        match state.get(identifier) {
            Some(entry) => {
                let locked = entry
                    .lockout_until
                    .map(|until| now_instant < until)
                    .unwrap_or(false);
                RateLimitInfo {
                    identifier: identifier.to_string(),
                    attempt_count: entry.attempt_count,
                    window_start: instant_to_utc(entry.window_start, now_instant, now_utc),
                    locked,
                    lockout_until: entry
                        .lockout_until
                        .and_then(|until| instant_to_utc_future(until, now_instant, now_utc)),
                }
            }
            None => RateLimitInfo {
                identifier: identifier.to_string(),
                attempt_count: 0,
                window_start: None,
                locked: false,
                lockout_until: None,
            },
        }
    }

    /// A broken limiter fails open: availability wins over lockout
    /// enforcement, but the condition itself is treated as critical.
    fn fail_open(&self, identifier: &str) -> RateLimitDecision {
        self.audit.critical(
            AuditKind::VaultCorruptionDetected,
            Some(identifier),
            "rate_limiter",
            "rate limiter state poisoned, failing open",
        );
        RateLimitDecision::Allowed
    }
}

fn instant_to_utc(
    instant: Instant,
    now_instant: Instant,
    now_utc: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let elapsed = now_instant.checked_duration_since(instant)?;
    let delta = chrono::Duration::from_std(elapsed).ok()?;
    Some(now_utc - delta)
}

fn instant_to_utc_future(
    instant: Instant,
    now_instant: Instant,
    now_utc: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let remaining = instant.checked_duration_since(now_instant)?;
    let delta = chrono::Duration::from_std(remaining).ok()?;
    Some(now_utc + delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuditSettings;

    fn limiter(settings: RateLimitSettings) -> (tempfile::TempDir, RateLimiter) {
        let tmp = tempfile::tempdir().unwrap();
        let audit = Arc::new(
            AuditLog::new(tmp.path().join("security.log"), AuditSettings::default()).unwrap(),
        );
        (tmp, RateLimiter::new(settings, audit))
    }

    #[test]
    fn test_exactly_n_attempts_allowed() {
        let (_tmp, rl) = limiter(RateLimitSettings::default());

        for _ in 0..5 {
            assert_eq!(rl.check("bob"), RateLimitDecision::Allowed);
            rl.record_failure("bob");
        }
        // The N+1st attempt is denied regardless of the credential.
        assert_eq!(rl.check("bob"), RateLimitDecision::Denied);
    }

    #[test]
    fn test_breach_reported_once() {
        let (_tmp, rl) = limiter(RateLimitSettings::default());
        for i in 1..=4 {
            assert!(!rl.record_failure("bob"), "attempt {} should not breach", i);
        }
        assert!(rl.record_failure("bob"));
        assert!(!rl.record_failure("bob"));
    }

    #[test]
    fn test_lockout_expires() {
        let (_tmp, rl) = limiter(RateLimitSettings {
            max_attempts: 2,
            window_secs: 60,
            lockout_secs: 0,
        });
        rl.record_failure("bob");
        rl.record_failure("bob");
        // Zero-length lockout: next check starts a fresh window.
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(rl.check("bob"), RateLimitDecision::Allowed);
    }

    #[test]
    fn test_reset_clears_state() {
        let (_tmp, rl) = limiter(RateLimitSettings::default());
        for _ in 0..5 {
            rl.record_failure("bob");
        }
        assert_eq!(rl.check("bob"), RateLimitDecision::Denied);
        rl.reset("bob");
        assert_eq!(rl.check("bob"), RateLimitDecision::Allowed);
    }

    #[test]
    fn test_identifiers_independent() {
        let (_tmp, rl) = limiter(RateLimitSettings::default());
        for _ in 0..5 {
            rl.record_failure("bob");
        }
        assert_eq!(rl.check("bob"), RateLimitDecision::Denied);
        assert_eq!(rl.check("alice"), RateLimitDecision::Allowed);
    }

    #[test]
    fn test_info_reflects_state() {
        let (_tmp, rl) = limiter(RateLimitSettings::default());
        assert_eq!(rl.info("bob").attempt_count, 0);

        rl.record_failure("bob");
        let info = rl.info("bob");
        assert_eq!(info.attempt_count, 1);
        assert!(!info.locked);
        assert!(info.window_start.is_some());

        for _ in 0..4 {
            rl.record_failure("bob");
        }
        let info = rl.info("bob");
        assert!(info.locked);
        assert!(info.lockout_until.is_some());
    }
}
