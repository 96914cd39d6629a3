use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Domain separation prefix for subkey derivation.
const SUBKEY_CONTEXT: &[u8] = b"phantomvault.subkey.v1";

pub const MASTER_KEY_LEN: usize = 64;
pub const AEAD_KEY_LEN: usize = 32;

/// Random 512-bit key that protects vault content. Never derived from the
/// password; only ever wrapped by password- and recovery-derived keys.
/// Zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; MASTER_KEY_LEN],
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut key = [0u8; MASTER_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != MASTER_KEY_LEN {
            return None;
        }
        let mut key = [0u8; MASTER_KEY_LEN];
        key.copy_from_slice(bytes);
        Some(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    /// Derive a 256-bit AEAD subkey bound to `domain`. Metadata and content
    /// use distinct domains so a key compromise in one context does not
    /// extend to the other.
    pub fn subkey(&self, domain: &str) -> DerivedKey {
        let mut hasher = Sha256::new();
        hasher.update(SUBKEY_CONTEXT);
        hasher.update([domain.len() as u8]);
        hasher.update(domain.as_bytes());
        hasher.update(self.key);
        let digest = hasher.finalize();

        let mut key = [0u8; AEAD_KEY_LEN];
        key.copy_from_slice(&digest);
        DerivedKey { key }
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never reaches Debug output.
        f.write_str("MasterKey(..)")
    }
}

/// A 256-bit key produced by the KDF or by subkey derivation, sized for
/// AES-256-GCM. Zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    key: [u8; AEAD_KEY_LEN],
}

impl DerivedKey {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != AEAD_KEY_LEN {
            return None;
        }
        let mut key = [0u8; AEAD_KEY_LEN];
        key.copy_from_slice(bytes);
        Some(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_keys_differ() {
        let a = MasterKey::generate();
        let b = MasterKey::generate();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_subkey_domain_separation() {
        let master = MasterKey::generate();
        let meta = master.subkey("metadata");
        let content = master.subkey("content");
        assert_ne!(meta.as_bytes(), content.as_bytes());

        // Deterministic per domain.
        let meta2 = master.subkey("metadata");
        assert_eq!(meta.as_bytes(), meta2.as_bytes());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let master = MasterKey::generate();
        let rendered = format!("{:?}", master);
        assert_eq!(rendered, "MasterKey(..)");
    }

    #[test]
    fn test_from_bytes_length_checked() {
        assert!(MasterKey::from_bytes(&[0u8; 63]).is_none());
        assert!(MasterKey::from_bytes(&[0u8; 64]).is_some());
        assert!(DerivedKey::from_bytes(&[0u8; 16]).is_none());
    }
}
