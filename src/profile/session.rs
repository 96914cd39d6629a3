use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::crypto::{DerivedKey, MasterKey};

/// AEAD subkey domains. Catalog metadata and folder content are encrypted
/// under different keys derived from the same master key.
pub const DOMAIN_METADATA: &str = "metadata";
pub const DOMAIN_CONTENT: &str = "content";

/// Short-lived holder of an unwrapped master key for one authenticated
/// profile. The key lives only in this object and is zeroed when the
/// session drops, including on error paths that unwind past it.
pub struct Session {
    profile_id: String,
    master_key: MasterKey,
    idle_timeout: Duration,
    last_activity: Mutex<Instant>,
    opened_via_recovery: bool,
}

impl Session {
    pub fn new(profile_id: String, master_key: MasterKey, idle_timeout: Duration) -> Self {
        Self {
            profile_id,
            master_key,
            idle_timeout,
            last_activity: Mutex::new(Instant::now()),
            opened_via_recovery: false,
        }
    }

    /// Session opened by redeeming a recovery token. Depending on policy,
    /// such a session may be restricted to changing the password.
    pub fn new_via_recovery(
        profile_id: String,
        master_key: MasterKey,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            opened_via_recovery: true,
            ..Self::new(profile_id, master_key, idle_timeout)
        }
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    pub fn master_key(&self) -> &MasterKey {
        &self.master_key
    }

    pub fn metadata_key(&self) -> DerivedKey {
        self.master_key.subkey(DOMAIN_METADATA)
    }

    pub fn content_key(&self) -> DerivedKey {
        self.master_key.subkey(DOMAIN_CONTENT)
    }

    pub fn opened_via_recovery(&self) -> bool {
        self.opened_via_recovery
    }

    /// Record activity, pushing the idle deadline forward.
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    /// An idle-expired session must not be used for further operations;
    /// callers discard it, which zeroizes the key.
    pub fn is_expired(&self) -> bool {
        match self.last_activity.lock() {
            Ok(last) => last.elapsed() > self.idle_timeout,
            // A poisoned clock cannot prove liveness; treat as expired.
            Err(_) => true,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("profile_id", &self.profile_id)
            .field("opened_via_recovery", &self.opened_via_recovery)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_session_not_expired() {
        let s = Session::new("p1".into(), MasterKey::generate(), Duration::from_secs(900));
        assert!(!s.is_expired());
        assert_eq!(s.profile_id(), "p1");
        assert!(!s.opened_via_recovery());
    }

    #[test]
    fn test_zero_timeout_expires() {
        let s = Session::new("p1".into(), MasterKey::generate(), Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(s.is_expired());
        s.touch();
        std::thread::sleep(Duration::from_millis(5));
        assert!(s.is_expired());
    }

    #[test]
    fn test_recovery_session_flagged() {
        let s = Session::new_via_recovery("p1".into(), MasterKey::generate(), Duration::from_secs(1));
        assert!(s.opened_via_recovery());
    }

    #[test]
    fn test_subkeys_differ_between_domains() {
        let s = Session::new("p1".into(), MasterKey::generate(), Duration::from_secs(900));
        assert_ne!(s.metadata_key().as_bytes(), s.content_key().as_bytes());
    }

    #[test]
    fn test_debug_output_has_no_key() {
        let s = Session::new("p1".into(), MasterKey::generate(), Duration::from_secs(900));
        let rendered = format!("{:?}", s);
        assert!(rendered.contains("p1"));
        assert!(!rendered.contains("master_key"));
    }
}
