use serde::Serialize;
use thiserror::Error;

use crate::crypto::CryptoError;

/// Top-level error type returned by the public vault API.
#[derive(Error, Debug)]
pub enum VaultError {
    /// Wrong password, unknown profile, or invalid recovery token.
    /// The three are deliberately indistinguishable to the caller.
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Too many attempts, try again later")]
    RateLimited,

    #[error("Not found")]
    NotFound,

    #[error("Already exists")]
    AlreadyExists,

    #[error("Integrity violation")]
    IntegrityViolation,

    #[error("Insufficient privilege")]
    InsufficientPrivilege,

    #[error("Session expired")]
    SessionExpired,

    #[error("Invalid operation in current state")]
    InvalidState,

    #[error("Entry is corrupted")]
    Corrupted,

    #[error("Unsupported schema version {0}")]
    Schema(u32),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}

impl VaultError {
    /// Stable machine-readable code for the frontend layer.
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::AuthenticationFailed => "AUTHENTICATION_FAILED",
            VaultError::RateLimited => "RATE_LIMITED",
            VaultError::NotFound => "NOT_FOUND",
            VaultError::AlreadyExists => "ALREADY_EXISTS",
            VaultError::IntegrityViolation => "INTEGRITY_VIOLATION",
            VaultError::InsufficientPrivilege => "INSUFFICIENT_PRIVILEGE",
            VaultError::SessionExpired => "SESSION_EXPIRED",
            VaultError::InvalidState => "INVALID_STATE",
            VaultError::Corrupted => "CORRUPTED",
            VaultError::Schema(_) => "SCHEMA_ERROR",
            VaultError::Crypto(_) => "CRYPTO_ERROR",
            VaultError::Io(_) => "IO_ERROR",
            VaultError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// User-facing message drawn from a fixed table. Internal details
    /// (paths, cipher errors, io causes) go to the audit log only.
    pub fn user_message(&self) -> &'static str {
        match self {
            VaultError::AuthenticationFailed => "Authentication failed",
            VaultError::RateLimited => "Too many attempts, try again later",
            VaultError::NotFound => "Not found",
            VaultError::AlreadyExists => "Already exists",
            VaultError::IntegrityViolation => "Integrity check failed",
            VaultError::InsufficientPrivilege => "Insufficient privilege",
            VaultError::SessionExpired => "Session expired",
            VaultError::InvalidState => "Operation not allowed in current state",
            VaultError::Corrupted => "Stored data is corrupted",
            VaultError::Schema(_) => "Unsupported data format version",
            VaultError::Crypto(_) => "Cryptographic operation failed",
            VaultError::Io(_) => "Storage operation failed",
            VaultError::Serialization(_) => "Storage operation failed",
        }
    }
}

// For passing errors to a frontend in JSON format
#[derive(Serialize)]
pub struct VaultErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&VaultError> for VaultErrorResponse {
    fn from(error: &VaultError) -> Self {
        VaultErrorResponse {
            code: error.code().to_string(),
            message: error.user_message().to_string(),
        }
    }
}

pub type VaultResult<T> = Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_not_found_share_no_detail() {
        // Unknown profile and wrong password must look identical to callers.
        let a = VaultError::AuthenticationFailed;
        assert_eq!(a.user_message(), "Authentication failed");
        assert_eq!(a.code(), "AUTHENTICATION_FAILED");
    }

    #[test]
    fn io_message_is_sanitized() {
        let e = VaultError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "/home/alice/secret_tax_2024 missing",
        ));
        assert!(!e.user_message().contains("alice"));
        assert!(!e.user_message().contains("secret"));
    }

    #[test]
    fn response_uses_fixed_table() {
        let e = VaultError::Corrupted;
        let resp = VaultErrorResponse::from(&e);
        assert_eq!(resp.code, "CORRUPTED");
        assert_eq!(resp.message, "Stored data is corrupted");
    }
}
