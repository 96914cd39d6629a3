use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ENTRY_SCHEMA_VERSION: u32 = 1;

/// Lifecycle of one hidden folder.
///
/// `Relocking` and `Removing` are transitional states persisted before the
/// corresponding multi-step operation begins, so an interrupted run is
/// visible to the next integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Locked,
    TemporarilyUnlocked,
    Relocking,
    Removing,
    Corrupted,
}

/// One hidden folder's record inside a profile's catalog, as stored on
/// disk at `catalog/<obfuscated_id>.entry`. Everything that could identify
/// the original folder lives in the AEAD-encrypted metadata blob; the
/// cleartext fields reveal only opaque names, sizes, and states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultEntry {
    pub schema_version: u32,

    /// Random 128-bit identifier, hex-encoded. Never derived from the
    /// original path.
    pub obfuscated_id: String,

    /// Blob directory holding the encrypted content tree, relative to the
    /// profile's vault directory.
    pub backup_rel_path: String,

    /// Hex SHA-256 of the plaintext tree, computed before encryption.
    pub content_checksum: String,

    /// AEAD ciphertext of [`super::metadata::VaultMetadata`], hex-encoded.
    pub metadata_ciphertext: String,
    pub metadata_nonce: String,
    pub metadata_aad: String,

    pub state: EntryState,
    pub created_at: DateTime<Utc>,
    pub last_unlocked_at: Option<DateTime<Utc>>,
}

impl VaultEntry {
    /// Associated data binding an entry's metadata blob to its profile and
    /// id, so blobs cannot be swapped between entries or profiles.
    pub fn metadata_aad_for(profile_id: &str, obfuscated_id: &str) -> String {
        format!("phantomvault.entry/{}/{}/metadata", profile_id, obfuscated_id)
    }

    pub fn summary(&self) -> EntrySummary {
        EntrySummary {
            obfuscated_id: self.obfuscated_id.clone(),
            state: self.state,
            created_at: self.created_at,
            last_unlocked_at: self.last_unlocked_at,
            original_path: None,
        }
    }
}

/// Listing view. `original_path` is populated only when the caller held a
/// session able to decrypt the metadata blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySummary {
    pub obfuscated_id: String,
    pub state: EntryState,
    pub created_at: DateTime<Utc>,
    pub last_unlocked_at: Option<DateTime<Utc>>,
    pub original_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_roundtrip() {
        let entry = VaultEntry {
            schema_version: ENTRY_SCHEMA_VERSION,
            obfuscated_id: "a0".repeat(16),
            backup_rel_path: format!("blobs/{}", "a0".repeat(16)),
            content_checksum: "11".repeat(32),
            metadata_ciphertext: "22".repeat(64),
            metadata_nonce: "33".repeat(12),
            metadata_aad: VaultEntry::metadata_aad_for("p1", &"a0".repeat(16)),
            state: EntryState::Locked,
            created_at: Utc::now(),
            last_unlocked_at: None,
        };

        let json = serde_json::to_string(&entry).unwrap();
        let parsed: VaultEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.obfuscated_id, entry.obfuscated_id);
        assert_eq!(parsed.state, EntryState::Locked);
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&EntryState::TemporarilyUnlocked).unwrap();
        assert_eq!(json, "\"temporarily_unlocked\"");
    }

    #[test]
    fn test_metadata_aad_distinct_per_profile() {
        let a = VaultEntry::metadata_aad_for("p1", "e1");
        let b = VaultEntry::metadata_aad_for("p2", "e1");
        assert_ne!(a, b);
    }

    #[test]
    fn test_summary_has_no_ciphertext() {
        let entry = VaultEntry {
            schema_version: ENTRY_SCHEMA_VERSION,
            obfuscated_id: "ff".repeat(16),
            backup_rel_path: "blobs/x".into(),
            content_checksum: "11".repeat(32),
            metadata_ciphertext: "22".repeat(64),
            metadata_nonce: "33".repeat(12),
            metadata_aad: "aad".into(),
            state: EntryState::Locked,
            created_at: Utc::now(),
            last_unlocked_at: None,
        };
        let json = serde_json::to_string(&entry.summary()).unwrap();
        assert!(!json.contains(&entry.metadata_ciphertext));
    }
}
