use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::KdfParams;

pub const PROFILE_SCHEMA_VERSION: u32 = 1;

/// Password-authentication block: the verifier is a KDF output compared in
/// constant time at login. It is never used as an encryption key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthBlock {
    /// Hex-encoded random salt.
    pub salt: String,
    /// Hex-encoded KDF(password, salt).
    pub verifier: String,
}

/// A wrapped copy of the master key under some derived key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrapBlock {
    /// Hex-encoded salt for the wrapping-key derivation.
    pub salt: String,
    /// Hex-encoded AEAD ciphertext (tag appended) of the master key.
    pub master_wrapped: String,
    /// Hex-encoded AEAD nonce.
    pub nonce: String,
    /// Associated data bound to this wrap.
    pub aad: String,
}

/// Recovery block: an independent wrap of the master key plus the verifier
/// used to locate the owning profile during redemption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryBlock {
    pub salt: String,
    /// Hex-encoded verifier for fast rejection of wrong tokens.
    pub verifier: String,
    pub master_wrapped: String,
    pub nonce: String,
    pub aad: String,
    /// Short hash identifying which token unlocks this profile. Not
    /// sufficient to test a token without the KDF.
    pub token_fingerprint: String,
}

/// On-disk profile record, one JSON file per profile under `profiles/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub schema_version: u32,

    /// Opaque 128-bit identifier, hex-encoded, random at creation.
    pub id: String,

    /// Human label. Not a secret, and not unique.
    pub name: String,

    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,

    pub kdf: KdfParams,

    pub auth: AuthBlock,

    /// Master key wrapped by the password-derived key.
    pub data: WrapBlock,

    pub recovery: RecoveryBlock,
}

impl ProfileRecord {
    /// Associated data binding the password wrap to this profile.
    pub fn password_aad(profile_id: &str) -> String {
        format!("phantomvault.profile/{}/password-wrap", profile_id)
    }

    /// Associated data binding the recovery wrap to this profile.
    pub fn recovery_aad(profile_id: &str) -> String {
        format!("phantomvault.profile/{}/recovery-wrap", profile_id)
    }

    pub fn summary(&self) -> ProfileSummary {
        ProfileSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            last_access_at: self.last_access_at,
        }
    }
}

/// Listing view without any credential material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
}
