//! Error types for Meshgate

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use thiserror::Error;

/// Result type alias using Meshgate Error
pub type Result<T> = std::result::Result<T, Error>;

/// Why a pre-auth key was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRejection {
    Unknown,
    Expired,
    Used,
    WrongNamespace,
}

impl std::fmt::Display for KeyRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "key does not exist"),
            Self::Expired => write!(f, "key has expired"),
            Self::Used => write!(f, "key has already been used"),
            Self::WrongNamespace => write!(f, "key belongs to a different namespace"),
        }
    }
}

/// Coarse classification used by callers to pick messages and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Unauthorized,
    Exhausted,
    Crypto,
    Storage,
    Config,
}

/// Meshgate error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Machine not found: {0}")]
    MachineNotFound(String),

    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Machine {machine} is not shared with namespace {namespace}")]
    GrantNotFound { machine: String, namespace: String },

    #[error("Machine already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Machine {machine} is already shared with namespace {namespace}")]
    AlreadyShared { machine: String, namespace: String },

    #[error("Machine {machine} already belongs to namespace {namespace}")]
    SelfShare { machine: String, namespace: String },

    #[error("{kind} with name {name} already exists")]
    DuplicateName { kind: &'static str, name: String },

    #[error("Address {0} is already assigned to another machine")]
    DuplicateAddress(IpAddr),

    #[error("Namespace {0} still owns machines")]
    NamespaceNotEmpty(String),

    #[error("Invalid or used pre-auth key: {0}")]
    InvalidOrUsedKey(KeyRejection),

    #[error("No free address left in prefix {0}")]
    AddressPoolExhausted(IpNetwork),

    #[error("Cannot decrypt message")]
    DecryptionFailed,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Malformed {kind}: {reason}")]
    MalformedKey { kind: &'static str, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MachineNotFound(_) | Error::NamespaceNotFound(_) | Error::GrantNotFound { .. } => {
                ErrorKind::NotFound
            }
            Error::AlreadyRegistered(_)
            | Error::AlreadyShared { .. }
            | Error::SelfShare { .. }
            | Error::DuplicateName { .. }
            | Error::DuplicateAddress(_)
            | Error::NamespaceNotEmpty(_) => ErrorKind::Conflict,
            Error::InvalidOrUsedKey(_) => ErrorKind::Unauthorized,
            Error::AddressPoolExhausted(_) => ErrorKind::Exhausted,
            Error::DecryptionFailed | Error::MalformedPayload(_) | Error::MalformedKey { .. } => {
                ErrorKind::Crypto
            }
            Error::Storage(_) | Error::Io(_) | Error::Serialization(_) => ErrorKind::Storage,
            Error::InvalidConfig(_) => ErrorKind::Config,
        }
    }

    /// Only a lost address race is worth retrying with a fresh allocation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::DuplicateAddress(_))
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::NotFound => 2,
            ErrorKind::Conflict => 3,
            ErrorKind::Unauthorized => 4,
            ErrorKind::Exhausted => 5,
            ErrorKind::Crypto => 6,
            ErrorKind::Storage => 7,
            ErrorKind::Config => 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinct() {
        let not_found = Error::MachineNotFound("7".to_string());
        let conflict = Error::DuplicateAddress("10.0.0.1".parse().unwrap());
        let crypto = Error::DecryptionFailed;
        let malformed = Error::MalformedPayload("eof".to_string());

        assert_eq!(not_found.kind(), ErrorKind::NotFound);
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        assert_eq!(crypto.kind(), ErrorKind::Crypto);
        assert_eq!(malformed.kind(), ErrorKind::Crypto);
        assert_ne!(not_found.exit_code(), conflict.exit_code());
    }

    #[test]
    fn test_only_duplicate_address_is_retryable() {
        assert!(Error::DuplicateAddress("10.0.0.1".parse().unwrap()).is_retryable());
        assert!(!Error::AlreadyRegistered("mkey:00".to_string()).is_retryable());
        assert!(!Error::AddressPoolExhausted("10.0.0.0/30".parse().unwrap()).is_retryable());
    }
}
