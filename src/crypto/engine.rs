use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

use super::keys::{DerivedKey, AEAD_KEY_LEN};

// Argon2id defaults
const ARGON_M_COST: u32 = 65536; // 64 MiB
const ARGON_T_COST: u32 = 3;
const ARGON_P_COST: u32 = 4;

// Hard floors; requests below these are rejected, not silently raised.
const ARGON_M_COST_MIN: u32 = 19456;
const ARGON_T_COST_MIN: u32 = 2;

pub const SALT_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 12; // AES-GCM
pub const TAG_LENGTH: usize = 16;

const HASH_BUF_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key size")]
    InvalidKeySize,

    #[error("Invalid nonce size")]
    InvalidNonceSize,

    #[error("OS random generator unavailable")]
    CsprngUnavailable,

    #[error("Decryption failed (integrity check error)")]
    InvalidTag,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("KDF failed: {0}")]
    KdfFailure(String),

    #[error("Self-test failed: {0}")]
    SelfTestFailed(&'static str),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Tunable Argon2id parameters, persisted per profile so records created
/// under older cost settings keep deriving the same keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
    pub salt_len: usize,
    pub key_len: usize,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_cost_kib: ARGON_M_COST,
            time_cost: ARGON_T_COST,
            parallelism: ARGON_P_COST,
            salt_len: SALT_LENGTH,
            key_len: 64,
        }
    }
}

impl KdfParams {
    /// Minimum legal parameters. Used by tests to keep KDF-heavy suites fast
    /// while staying inside the enforced floor.
    pub fn floor() -> Self {
        Self {
            memory_cost_kib: ARGON_M_COST_MIN,
            time_cost: ARGON_T_COST_MIN,
            parallelism: 1,
            salt_len: 16,
            key_len: 64,
        }
    }

    fn validate(&self) -> CryptoResult<()> {
        if self.memory_cost_kib < ARGON_M_COST_MIN {
            return Err(CryptoError::KdfFailure(format!(
                "memory cost {} below floor {}",
                self.memory_cost_kib, ARGON_M_COST_MIN
            )));
        }
        if self.time_cost < ARGON_T_COST_MIN {
            return Err(CryptoError::KdfFailure(format!(
                "time cost {} below floor {}",
                self.time_cost, ARGON_T_COST_MIN
            )));
        }
        if self.salt_len < 16 {
            return Err(CryptoError::KdfFailure("salt too short".into()));
        }
        if self.key_len != 32 && self.key_len != 64 {
            return Err(CryptoError::KdfFailure("key length must be 32 or 64".into()));
        }
        Ok(())
    }
}

/// Stateless cryptographic primitives. Constructed once per process;
/// construction runs a round-trip self-test and fails hard if the
/// environment is unable to produce sane results.
pub struct CryptoEngine {
    _private: (),
}

impl CryptoEngine {
    pub fn new() -> CryptoResult<Self> {
        let engine = Self { _private: () };
        engine.self_test()?;
        Ok(engine)
    }

    // ==================== KEY DERIVATION ====================

    /// Derive `params.key_len` bytes from `secret` using Argon2id.
    /// Deterministic: same inputs produce the same output.
    pub fn derive_key(
        &self,
        secret: &[u8],
        salt: &[u8],
        params: &KdfParams,
    ) -> CryptoResult<Zeroizing<Vec<u8>>> {
        params.validate()?;
        if salt.len() < 16 {
            return Err(CryptoError::KdfFailure("salt too short".into()));
        }

        let argon_params = Params::new(
            params.memory_cost_kib,
            params.time_cost,
            params.parallelism,
            Some(params.key_len),
        )
        .map_err(|e| CryptoError::KdfFailure(format!("Argon2 params error: {}", e)))?;

        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

        let mut key = Zeroizing::new(vec![0u8; params.key_len]);
        argon
            .hash_password_into(secret, salt, &mut key)
            .map_err(|e| CryptoError::KdfFailure(format!("KDF failed: {}", e)))?;

        Ok(key)
    }

    /// Derive a 256-bit AEAD key from `secret`.
    pub fn derive_aead_key(
        &self,
        secret: &[u8],
        salt: &[u8],
        params: &KdfParams,
    ) -> CryptoResult<DerivedKey> {
        let params = KdfParams {
            key_len: AEAD_KEY_LEN,
            ..*params
        };
        let raw = self.derive_key(secret, salt, &params)?;
        DerivedKey::from_bytes(&raw).ok_or(CryptoError::InvalidKeySize)
    }

    // ==================== RANDOM GENERATION ====================

    /// Draw `n` bytes from the OS CSPRNG. Fails rather than falling back to
    /// a weaker source.
    pub fn random_bytes(&self, n: usize) -> CryptoResult<Vec<u8>> {
        let mut buf = vec![0u8; n];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|_| CryptoError::CsprngUnavailable)?;
        Ok(buf)
    }

    pub fn new_salt(&self) -> CryptoResult<Vec<u8>> {
        self.random_bytes(SALT_LENGTH)
    }

    pub fn new_nonce(&self) -> CryptoResult<[u8; NONCE_LENGTH]> {
        let bytes = self.random_bytes(NONCE_LENGTH)?;
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce.copy_from_slice(&bytes);
        Ok(nonce)
    }

    /// Random 128-bit identifier with no derivation from any input.
    pub fn new_opaque_id(&self) -> CryptoResult<[u8; 16]> {
        let bytes = self.random_bytes(16)?;
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes);
        Ok(id)
    }

    // ==================== AEAD ====================

    /// AES-256-GCM encrypt. Returns ciphertext with the 16-byte tag appended.
    pub fn aead_encrypt(
        &self,
        key: &DerivedKey,
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        if nonce.len() != NONCE_LENGTH {
            return Err(CryptoError::InvalidNonceSize);
        }
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|_| CryptoError::InvalidKeySize)?;

        cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// AES-256-GCM decrypt. Any difference in ciphertext, nonce, AAD, or key
    /// versus encryption yields `InvalidTag`; no partial output is produced.
    pub fn aead_decrypt(
        &self,
        key: &DerivedKey,
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        if nonce.len() != NONCE_LENGTH {
            return Err(CryptoError::InvalidNonceSize);
        }
        if ciphertext.len() < TAG_LENGTH {
            return Err(CryptoError::InvalidTag);
        }
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|_| CryptoError::InvalidKeySize)?;

        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::InvalidTag)
    }

    // ==================== HASHING / COMPARISON ====================

    /// SHA-256 of a file's contents, streamed.
    pub fn hash_file(&self, path: &Path) -> CryptoResult<[u8; 32]> {
        let file = std::fs::File::open(path)?;
        let mut reader = std::io::BufReader::new(file);
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Ok(out)
    }

    /// Constant-time equality. A length mismatch is rejected without
    /// shortcutting the byte comparison.
    pub fn ct_eq(&self, a: &[u8], b: &[u8]) -> bool {
        let n = a.len().min(b.len());
        let bytes_equal = a[..n].ct_eq(&b[..n]);
        let lengths_equal = (a.len() as u64).ct_eq(&(b.len() as u64));
        bool::from(bytes_equal & lengths_equal)
    }

    // ==================== SELF-TEST ====================

    /// Round-trip sanity check run at construction. Failure aborts
    /// initialization: a vault must not operate on a broken primitive.
    fn self_test(&self) -> CryptoResult<()> {
        // KDF determinism at the floor parameters.
        let params = KdfParams {
            key_len: 32,
            ..KdfParams::floor()
        };
        let salt = [0x5a; 16];
        let k1 = self.derive_key(b"self-test", &salt, &params)?;
        let k2 = self.derive_key(b"self-test", &salt, &params)?;
        if k1.as_slice() != k2.as_slice() {
            return Err(CryptoError::SelfTestFailed("KDF not deterministic"));
        }

        // AEAD round-trip.
        let key = DerivedKey::from_bytes(&k1).ok_or(CryptoError::InvalidKeySize)?;
        let nonce = self.new_nonce()?;
        let plaintext = b"phantomvault self-test block";
        let ct = self.aead_encrypt(&key, &nonce, b"st", plaintext)?;
        let pt = self.aead_decrypt(&key, &nonce, b"st", &ct)?;
        if pt != plaintext {
            return Err(CryptoError::SelfTestFailed("AEAD round-trip mismatch"));
        }

        // RNG output must differ between draws and look non-degenerate.
        let r1 = self.random_bytes(32)?;
        let r2 = self.random_bytes(32)?;
        if r1 == r2 {
            return Err(CryptoError::SelfTestFailed("RNG produced repeated output"));
        }
        for sample in [&r1, &r2] {
            let mut seen = [false; 256];
            let unique = sample.iter().filter(|&&b| {
                let fresh = !seen[b as usize];
                seen[b as usize] = true;
                fresh
            });
            if unique.count() < 16 {
                return Err(CryptoError::SelfTestFailed("RNG output not diverse"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CryptoEngine {
        CryptoEngine::new().unwrap()
    }

    fn test_params() -> KdfParams {
        KdfParams::floor()
    }

    #[test]
    fn test_kdf_determinism() {
        let e = engine();
        let salt = e.new_salt().unwrap();
        let k1 = e.derive_key(b"password", &salt, &test_params()).unwrap();
        let k2 = e.derive_key(b"password", &salt, &test_params()).unwrap();
        assert_eq!(k1.as_slice(), k2.as_slice());
        assert_eq!(k1.len(), 64);
    }

    #[test]
    fn test_kdf_salt_sensitivity() {
        let e = engine();
        let k1 = e.derive_key(b"password", &[1u8; 16], &test_params()).unwrap();
        let k2 = e.derive_key(b"password", &[2u8; 16], &test_params()).unwrap();
        assert_ne!(k1.as_slice(), k2.as_slice());
    }

    #[test]
    fn test_kdf_floor_enforced() {
        let e = engine();
        let weak = KdfParams {
            memory_cost_kib: 1024,
            ..test_params()
        };
        assert!(matches!(
            e.derive_key(b"pw", &[0u8; 16], &weak),
            Err(CryptoError::KdfFailure(_))
        ));

        let shallow = KdfParams {
            time_cost: 1,
            ..test_params()
        };
        assert!(e.derive_key(b"pw", &[0u8; 16], &shallow).is_err());
    }

    #[test]
    fn test_aead_roundtrip() {
        let e = engine();
        let key = DerivedKey::from_bytes(&[7u8; 32]).unwrap();
        let nonce = e.new_nonce().unwrap();
        let ct = e.aead_encrypt(&key, &nonce, b"aad", b"secret payload").unwrap();
        assert_ne!(&ct[..14], b"secret payload");
        let pt = e.aead_decrypt(&key, &nonce, b"aad", &ct).unwrap();
        assert_eq!(pt, b"secret payload");
    }

    #[test]
    fn test_aead_tamper_detected() {
        let e = engine();
        let key = DerivedKey::from_bytes(&[7u8; 32]).unwrap();
        let nonce = e.new_nonce().unwrap();
        let mut ct = e.aead_encrypt(&key, &nonce, b"aad", b"payload").unwrap();

        // Flip one bit anywhere in the blob.
        ct[3] ^= 0x01;
        assert!(matches!(
            e.aead_decrypt(&key, &nonce, b"aad", &ct),
            Err(CryptoError::InvalidTag)
        ));
    }

    #[test]
    fn test_aead_aad_binding() {
        let e = engine();
        let key = DerivedKey::from_bytes(&[7u8; 32]).unwrap();
        let nonce = e.new_nonce().unwrap();
        let ct = e.aead_encrypt(&key, &nonce, b"context-a", b"payload").unwrap();
        assert!(e.aead_decrypt(&key, &nonce, b"context-b", &ct).is_err());
    }

    #[test]
    fn test_aead_wrong_key_fails() {
        let e = engine();
        let k1 = DerivedKey::from_bytes(&[1u8; 32]).unwrap();
        let k2 = DerivedKey::from_bytes(&[2u8; 32]).unwrap();
        let nonce = e.new_nonce().unwrap();
        let ct = e.aead_encrypt(&k1, &nonce, b"", b"payload").unwrap();
        assert!(e.aead_decrypt(&k2, &nonce, b"", &ct).is_err());
    }

    #[test]
    fn test_nonce_uniqueness() {
        let e = engine();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(e.new_nonce().unwrap()));
        }
    }

    #[test]
    fn test_opaque_id_uniqueness() {
        let e = engine();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(e.new_opaque_id().unwrap()));
        }
    }

    #[test]
    fn test_ct_eq() {
        let e = engine();
        assert!(e.ct_eq(b"abcd", b"abcd"));
        assert!(!e.ct_eq(b"abcd", b"abce"));
        assert!(!e.ct_eq(b"abcd", b"abc"));
        assert!(!e.ct_eq(b"", b"x"));
        assert!(e.ct_eq(b"", b""));
    }

    #[test]
    fn test_hash_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.bin");
        std::fs::write(&path, b"hello\n").unwrap();

        let e = engine();
        let digest = e.hash_file(&path).unwrap();
        // SHA-256("hello\n")
        assert_eq!(
            hex::encode(digest),
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }
}
