//! Recovery tokens: a high-entropy secret independent of the password that
//! unwraps the same master key. The display form is transcribable by hand,
//! carries a checksum group so typos are caught before any KDF work, and
//! maps back to the underlying random bytes exactly.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::config::VaultSettings;
use crate::crypto::{CryptoEngine, DerivedKey, KdfParams, MasterKey};
use crate::error::{VaultError, VaultResult};
use crate::profile::record::{ProfileRecord, RecoveryBlock};
use crate::profile::{SecretStore, Session};
use crate::security::audit::{AuditKind, AuditLog, Severity};
use crate::security::rate_limiter::{RateLimitDecision, RateLimiter};

/// Crockford base32: no I, L, O, U; decoding aliases the confusable pairs.
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// 160 bits of entropy → eight groups of four symbols, plus one checksum
/// group.
pub const TOKEN_ENTROPY_LEN: usize = 20;
const DATA_SYMBOLS: usize = TOKEN_ENTROPY_LEN * 8 / 5;
const CHECK_SYMBOLS: usize = 4;
const GROUP_LEN: usize = 4;

const FINGERPRINT_CONTEXT: &[u8] = b"phantomvault.recovery.fingerprint.v1";
const VERIFIER_CONTEXT: &[u8] = b"phantomvault.recovery.verifier.v1";

/// Rate-limit identifier for redemption attempts. Redemption scans all
/// profiles, so the gate is global rather than per profile.
const REDEEM_RATE_ID: &str = "recovery-redeem";

// ==================== TOKEN FORMAT ====================

fn encode_symbols(bytes: &[u8], symbols: usize) -> String {
    let mut out = String::with_capacity(symbols);
    let mut acc: u32 = 0;
    let mut bits = 0;
    let mut produced = 0;
    for &byte in bytes {
        acc = (acc << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 && produced < symbols {
            bits -= 5;
            let index = ((acc >> bits) & 0x1f) as usize;
            out.push(ALPHABET[index] as char);
            produced += 1;
        }
    }
    out
}

fn symbol_value(c: char) -> Option<u8> {
    // Crockford aliases for hand-transcribed input.
    let c = match c.to_ascii_uppercase() {
        'O' => '0',
        'I' | 'L' => '1',
        other => other,
    };
    ALPHABET.iter().position(|&a| a as char == c).map(|i| i as u8)
}

fn decode_symbols(symbols: &str, out_len: usize) -> Option<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits = 0;
    let mut out = Vec::with_capacity(out_len);
    for c in symbols.chars() {
        acc = (acc << 5) | u32::from(symbol_value(c)?);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((acc >> bits) & 0xff) as u8);
        }
    }
    if out.len() != out_len {
        return None;
    }
    Some(out)
}

fn checksum_group(entropy: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_CONTEXT);
    hasher.update(entropy);
    let digest = hasher.finalize();
    encode_symbols(&digest[..3], CHECK_SYMBOLS)
}

/// A recovery token's underlying secret. Zeroed on drop; the display form
/// should be shown once and never logged.
pub struct RecoveryToken {
    entropy: Zeroizing<[u8; TOKEN_ENTROPY_LEN]>,
}

impl RecoveryToken {
    pub fn generate(engine: &CryptoEngine) -> VaultResult<Self> {
        let bytes = engine.random_bytes(TOKEN_ENTROPY_LEN)?;
        let mut entropy = Zeroizing::new([0u8; TOKEN_ENTROPY_LEN]);
        entropy.copy_from_slice(&bytes);
        Ok(Self { entropy })
    }

    /// Grouped display form, e.g. `XXXX-XXXX-…-XXXX-CCCC`.
    pub fn display(&self) -> String {
        let mut symbols = encode_symbols(self.entropy.as_ref(), DATA_SYMBOLS);
        symbols.push_str(&checksum_group(self.entropy.as_ref()));
        symbols
            .as_bytes()
            .chunks(GROUP_LEN)
            .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Parse a transcribed token. Separator and case variations are
    /// tolerated; a checksum mismatch fails before any profile is touched.
    pub fn parse(input: &str) -> VaultResult<Self> {
        let symbols: String = input
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();
        if symbols.len() != DATA_SYMBOLS + CHECK_SYMBOLS {
            return Err(VaultError::AuthenticationFailed);
        }
        let (data, check) = symbols.split_at(DATA_SYMBOLS);
        let Some(bytes) = decode_symbols(data, TOKEN_ENTROPY_LEN) else {
            return Err(VaultError::AuthenticationFailed);
        };

        let mut entropy = Zeroizing::new([0u8; TOKEN_ENTROPY_LEN]);
        entropy.copy_from_slice(&bytes);

        let expected = checksum_group(entropy.as_ref());
        let normalized: String = check
            .chars()
            .map(|c| match symbol_value(c) {
                Some(v) => ALPHABET[v as usize] as char,
                None => '?',
            })
            .collect();
        if normalized != expected {
            return Err(VaultError::AuthenticationFailed);
        }
        Ok(Self { entropy })
    }

    pub fn entropy(&self) -> &[u8] {
        self.entropy.as_ref()
    }

    /// Short public identifier of this token. Far too short to test a
    /// candidate token against, long enough to tell tokens apart.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_CONTEXT);
        hasher.update([0xff]);
        hasher.update(self.entropy.as_ref());
        hex::encode(&hasher.finalize()[..8])
    }
}

/// Verifier stored alongside the recovery wrap: a domain-separated hash of
/// the already-hardened recovery key. Cheap to recompute during the
/// profile scan; the KDF hardness lives in deriving `k_rec` itself.
pub fn recovery_verifier(k_rec: &DerivedKey, salt: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(VERIFIER_CONTEXT);
    hasher.update(salt);
    hasher.update(k_rec.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Build the on-record recovery block for a master key: fresh salt, fresh
/// token, verifier, and the recovery-wrapped master key.
pub fn build_recovery_block(
    engine: &CryptoEngine,
    kdf: &KdfParams,
    profile_id: &str,
    master: &MasterKey,
) -> VaultResult<(RecoveryBlock, RecoveryToken)> {
    let token = RecoveryToken::generate(engine)?;
    let salt = engine.random_bytes(kdf.salt_len)?;
    let k_rec = engine.derive_aead_key(token.entropy(), &salt, kdf)?;

    let verifier = recovery_verifier(&k_rec, &salt);
    let nonce = engine.new_nonce()?;
    let aad = ProfileRecord::recovery_aad(profile_id);
    let wrapped = engine.aead_encrypt(&k_rec, &nonce, aad.as_bytes(), master.as_bytes())?;

    Ok((
        RecoveryBlock {
            salt: hex::encode(&salt),
            verifier: hex::encode(verifier),
            master_wrapped: hex::encode(wrapped),
            nonce: hex::encode(nonce),
            aad,
            token_fingerprint: token.fingerprint(),
        },
        token,
    ))
}

// ==================== REDEMPTION ====================

/// Redeems recovery tokens against the profile store. There is no stored
/// pointer from token to profile; the owning profile is located by a
/// constant-time verifier scan across all records.
pub struct RecoveryService {
    store: SecretStore,
    engine: Arc<CryptoEngine>,
    audit: Arc<AuditLog>,
    rate_limiter: Arc<RateLimiter>,
    settings: VaultSettings,
}

impl RecoveryService {
    pub fn new(
        store: SecretStore,
        engine: Arc<CryptoEngine>,
        audit: Arc<AuditLog>,
        rate_limiter: Arc<RateLimiter>,
        settings: VaultSettings,
    ) -> Self {
        Self {
            store,
            engine,
            audit,
            rate_limiter,
            settings,
        }
    }

    /// Redeem a token: returns an authenticated session for the profile it
    /// unlocks. The caller is expected to change the password promptly;
    /// with `force_rotate_recovery_after_redeem` set, the vault refuses
    /// other operations until that happens.
    pub fn redeem(&self, token_input: &str) -> VaultResult<Session> {
        if self.rate_limiter.check(REDEEM_RATE_ID) == RateLimitDecision::Denied {
            return Err(VaultError::RateLimited);
        }

        // Checksum failures are transcription errors; they do not count
        // against the limiter and touch no profile.
        let token = RecoveryToken::parse(token_input)?;

        let records = self.store.load_all()?;
        // Scan every profile, accumulating matches without early exit.
        let mut matched: Vec<(ProfileRecord, DerivedKey)> = Vec::new();
        for record in records {
            let Ok(salt) = hex::decode(&record.recovery.salt) else {
                continue;
            };
            let Ok(stored_verifier) = hex::decode(&record.recovery.verifier) else {
                continue;
            };
            let k_rec = self.engine.derive_aead_key(token.entropy(), &salt, &record.kdf)?;
            let candidate = recovery_verifier(&k_rec, &salt);
            if self.engine.ct_eq(&candidate, &stored_verifier) {
                matched.push((record, k_rec));
            }
        }

        if matched.len() > 1 {
            // Two profiles sharing a verifier means the store is damaged;
            // redemption must not guess.
            self.audit.critical(
                AuditKind::VaultCorruptionDetected,
                None,
                "recovery",
                &format!("recovery verifier matched {} profiles", matched.len()),
            );
            return Err(VaultError::Corrupted);
        }

        match matched.pop() {
            Some((record, k_rec)) => self.open_session(record, &k_rec),
            None => {
                self.rate_limiter.record_failure(REDEEM_RATE_ID);
                self.audit.warning(
                    AuditKind::AuthFailure,
                    None,
                    "recovery",
                    "recovery token did not match any profile",
                );
                Err(VaultError::AuthenticationFailed)
            }
        }
    }

    fn open_session(&self, record: ProfileRecord, k_rec: &DerivedKey) -> VaultResult<Session> {
        let nonce = hex::decode(&record.recovery.nonce)
            .map_err(|_| VaultError::Corrupted)?;
        let wrapped = hex::decode(&record.recovery.master_wrapped)
            .map_err(|_| VaultError::Corrupted)?;

        let master_bytes = self
            .engine
            .aead_decrypt(k_rec, &nonce, record.recovery.aad.as_bytes(), &wrapped)
            .map_err(|_| {
                self.audit.critical(
                    AuditKind::VaultCorruptionDetected,
                    Some(&record.id),
                    "recovery",
                    "recovery verifier matched but master key unwrap failed",
                );
                VaultError::Corrupted
            })?;

        let master = MasterKey::from_bytes(&master_bytes).ok_or(VaultError::Corrupted)?;

        self.rate_limiter.reset(REDEEM_RATE_ID);
        let mut details = BTreeMap::new();
        details.insert(
            "token_fingerprint".into(),
            record.recovery.token_fingerprint.clone(),
        );
        self.audit.record(
            AuditKind::RecoveryRedemption,
            Severity::Warning,
            Some(&record.id),
            "recovery",
            "master key recovered via recovery token",
            details,
        );

        Ok(Session::new_via_recovery(
            record.id,
            master,
            Duration::from_secs(self.settings.session.idle_timeout_secs),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CryptoEngine {
        CryptoEngine::new().unwrap()
    }

    #[test]
    fn test_token_display_shape() {
        let token = RecoveryToken::generate(&engine()).unwrap();
        let display = token.display();
        let groups: Vec<&str> = display.split('-').collect();
        assert_eq!(groups.len(), 9);
        assert!(groups.iter().all(|g| g.len() == 4));
        assert!(display
            .chars()
            .all(|c| c == '-' || ALPHABET.contains(&(c as u8))));
    }

    #[test]
    fn test_token_roundtrip() {
        let token = RecoveryToken::generate(&engine()).unwrap();
        let parsed = RecoveryToken::parse(&token.display()).unwrap();
        assert_eq!(parsed.entropy(), token.entropy());
    }

    #[test]
    fn test_token_parse_tolerates_formatting() {
        let token = RecoveryToken::generate(&engine()).unwrap();
        let sloppy = token.display().to_lowercase().replace('-', " ");
        let parsed = RecoveryToken::parse(&sloppy).unwrap();
        assert_eq!(parsed.entropy(), token.entropy());
    }

    #[test]
    fn test_token_checksum_catches_typo() {
        let token = RecoveryToken::generate(&engine()).unwrap();
        let mut chars: Vec<char> = token.display().chars().collect();
        // Swap the first symbol for a different alphabet member.
        let original = chars[0];
        chars[0] = if original == 'A' { 'B' } else { 'A' };
        let altered: String = chars.into_iter().collect();
        assert!(RecoveryToken::parse(&altered).is_err());
    }

    #[test]
    fn test_token_confusable_aliases() {
        let token = RecoveryToken::generate(&engine()).unwrap();
        let aliased = token.display().replace('0', "O").replace('1', "I");
        let parsed = RecoveryToken::parse(&aliased).unwrap();
        assert_eq!(parsed.entropy(), token.entropy());
    }

    #[test]
    fn test_token_wrong_length_rejected() {
        assert!(RecoveryToken::parse("ABCD-EFGH").is_err());
        assert!(RecoveryToken::parse("").is_err());
    }

    #[test]
    fn test_fingerprints_differ() {
        let e = engine();
        let a = RecoveryToken::generate(&e).unwrap();
        let b = RecoveryToken::generate(&e).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 16);
    }

    #[test]
    fn test_recovery_block_unwraps_master() {
        let e = engine();
        let master = MasterKey::generate();
        let kdf = KdfParams::floor();
        let (block, token) = build_recovery_block(&e, &kdf, "prof1", &master).unwrap();

        let salt = hex::decode(&block.salt).unwrap();
        let k_rec = e.derive_aead_key(token.entropy(), &salt, &kdf).unwrap();
        assert_eq!(
            hex::encode(recovery_verifier(&k_rec, &salt)),
            block.verifier
        );

        let nonce = hex::decode(&block.nonce).unwrap();
        let wrapped = hex::decode(&block.master_wrapped).unwrap();
        let unwrapped = e
            .aead_decrypt(&k_rec, &nonce, block.aad.as_bytes(), &wrapped)
            .unwrap();
        assert_eq!(unwrapped, master.as_bytes());
    }
}
