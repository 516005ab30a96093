//! Error types for Signet
//!
//! Each subsystem error maps to an HTTP status at the control-plane
//! boundary (§6); see `error::http_status`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignetError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("name already in use: {0}")]
    NameInUse(String),

    #[error("name cannot be empty")]
    EmptyName,

    #[error("key is not encrypted")]
    NotEncrypted,

    #[error("key is already encrypted")]
    AlreadyEncrypted,

    #[error("key is not active")]
    NotActive,

    #[error("passphrase is required to delete this key")]
    PassphraseRequired,

    #[error("passphrase cannot be empty")]
    EmptyPassphrase,

    #[error("invalid passphrase")]
    InvalidPassphrase,

    #[error("invalid secret encoding: {0}")]
    InvalidSecretEncoding(String),

    #[error("invalid ciphertext")]
    InvalidCiphertext,

    #[error("request already processed")]
    AlreadyProcessed,

    #[error("request expired")]
    Expired,

    #[error("connection token not found")]
    TokenNotFound,

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("crypto failure")]
    CryptoFailure,

    #[error("nostr error: {0}")]
    NostrError(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transient I/O error: {0}")]
    TransientIo(String),
}

impl From<nostr::key::Error> for SignetError {
    fn from(e: nostr::key::Error) -> Self {
        SignetError::NostrError(e.to_string())
    }
}

impl From<nostr::event::Error> for SignetError {
    fn from(e: nostr::event::Error) -> Self {
        SignetError::NostrError(e.to_string())
    }
}

/// Maps an error to the status table in §6. Used by the HTTP layer only;
/// the NIP-46 backend never touches HTTP status codes.
pub fn http_status(err: &SignetError) -> u16 {
    match err {
        SignetError::InvalidArgument(_)
        | SignetError::EmptyName
        | SignetError::EmptyPassphrase
        | SignetError::InvalidSecretEncoding(_)
        | SignetError::InvalidPassphrase
        | SignetError::PassphraseRequired
        | SignetError::NotEncrypted
        | SignetError::AlreadyEncrypted
        | SignetError::NotActive => 400,
        SignetError::NotFound(_) | SignetError::KeyNotFound(_) | SignetError::TokenNotFound => 404,
        SignetError::NameInUse(_) | SignetError::Conflict(_) | SignetError::AlreadyProcessed => 409,
        SignetError::NotAuthorized(_) => 401,
        _ => 500,
    }
}

pub type Result<T> = std::result::Result<T, SignetError>;
