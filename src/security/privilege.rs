use std::collections::HashSet;

/// Platform capabilities the core may need but cannot acquire itself.
/// The elevation dialog (pkexec / UAC / sudo) belongs to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Change file ownership during restore (chown on POSIX).
    RestoreOwnership,
    /// Read or relocate paths the current user cannot normally access.
    ElevatedFilesystem,
}

/// Seam between the core and the platform's privilege elevation. The core
/// only ever asks; it never prompts.
pub trait PrivilegeProvider: Send + Sync {
    /// Whether the capability is currently held.
    fn holds(&self, capability: Capability) -> bool;

    /// Ask the platform layer to acquire the capability. Returns whether it
    /// is held afterwards; implementations may prompt the user.
    fn request(&self, capability: Capability) -> bool;
}

/// Fixed-capability provider. Production callers wire in a real elevation
/// bridge; tests and unprivileged runs use this.
#[derive(Debug, Default)]
pub struct StaticPrivilegeProvider {
    granted: HashSet<Capability>,
}

impl StaticPrivilegeProvider {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            granted: capabilities.into_iter().collect(),
        }
    }
}

impl PrivilegeProvider for StaticPrivilegeProvider {
    fn holds(&self, capability: Capability) -> bool {
        self.granted.contains(&capability)
    }

    fn request(&self, capability: Capability) -> bool {
        // Static sets cannot acquire anything new.
        self.holds(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_holds_nothing() {
        let p = StaticPrivilegeProvider::none();
        assert!(!p.holds(Capability::RestoreOwnership));
        assert!(!p.request(Capability::RestoreOwnership));
    }

    #[test]
    fn test_granted_capability_held() {
        let p = StaticPrivilegeProvider::with([Capability::RestoreOwnership]);
        assert!(p.holds(Capability::RestoreOwnership));
        assert!(!p.holds(Capability::ElevatedFilesystem));
    }
}
