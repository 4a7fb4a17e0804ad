//! Error types. Every failure is reported as a typed value; the caller decides what the user sees.

use thiserror::Error;

/// How a failure should be treated by the messaging layer above this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The handshake was aborted and no session exists. The peer cannot be reached securely right now.
    Fatal,
    /// The message was discarded and the session left untouched.
    Rejected,
    /// Nothing was mutated, the operation can be retried.
    Transient,
    /// The caller used the API in a way this layer does not guard against.
    Programmer,
}

/// Errors raised by the session layer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("pre-key bundle fetch failed: {0}")]
    BundleFetchFailed(#[source] DirectoryError),

    #[error("signed pre-key signature does not verify against the identity key")]
    InvalidSignature,

    #[error("identity key presented by {peer} does not match the one the directory lists")]
    IdentityMismatch { peer: String },

    #[error("insufficient key material: {0}")]
    InsufficientKeyMaterial(String),

    #[error("replayed message: counter {counter} already consumed (next expected {expected})")]
    ReplayDetected { counter: u32, expected: u32 },

    #[error("out of order message: counter {counter}, expected {expected}")]
    OutOfOrder { counter: u32, expected: u32 },

    #[error("too many skipped messages (max: {max}, requested: {requested})")]
    TooManySkipped { max: u32, requested: u32 },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("message failed authentication")]
    DecryptionFailed,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),

    #[error("no identity key has been provisioned")]
    IdentityMissing,

    #[error("sending chain exhausted")]
    ChainExhausted,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed")]
    EncryptionFailed,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidSignature | Error::IdentityMismatch { .. } | Error::InsufficientKeyMaterial(_) => {
                ErrorClass::Fatal
            }
            Error::ReplayDetected { .. }
            | Error::OutOfOrder { .. }
            | Error::TooManySkipped { .. }
            | Error::MalformedMessage(_)
            | Error::DecryptionFailed => ErrorClass::Rejected,
            Error::BundleFetchFailed(_) | Error::StorageUnavailable(_) => ErrorClass::Transient,
            Error::IdentityMissing
            | Error::ChainExhausted
            | Error::KeyDerivation
            | Error::EncryptionFailed => ErrorClass::Programmer,
        }
    }

    /// Safe to retry as-is: no session state was mutated.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<hkdf::InvalidLength> for Error {
    fn from(_: hkdf::InvalidLength) -> Self {
        Error::KeyDerivation
    }
}

/// Failures reported by the key directory collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),
}

/// Failures of the persistent store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("store handle unavailable: {0}")]
    Unavailable(String),

    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("one-time pre-key {0} was already consumed")]
    PreKeyConsumed(String),
}

/// Failures while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_taxonomy() {
        assert_eq!(Error::InvalidSignature.class(), ErrorClass::Fatal);
        assert_eq!(Error::IdentityMismatch { peer: "alice".into() }.class(), ErrorClass::Fatal);
        assert_eq!(
            Error::ReplayDetected { counter: 1, expected: 2 }.class(),
            ErrorClass::Rejected
        );
        assert_eq!(Error::DecryptionFailed.class(), ErrorClass::Rejected);
        assert!(Error::BundleFetchFailed(DirectoryError::Timeout(10)).is_retryable());
        assert!(Error::StorageUnavailable(StoreError::Unavailable("closed".into())).is_retryable());
        assert!(!Error::MalformedMessage("short".into()).is_retryable());
        assert_eq!(Error::IdentityMissing.class(), ErrorClass::Programmer);
    }
}
