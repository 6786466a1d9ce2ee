//! Crate-wide error type.

use thiserror::Error;

/// Errors produced while reading, writing, or manipulating a keystore.
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("entry not found")]
    EntryNotFound,

    #[error("wrong entry type")]
    WrongEntryType,

    #[error("private key must not be empty")]
    EmptyPrivateKey,

    #[error("certificate type must not be empty")]
    EmptyCertificateType,

    #[error("certificate content must not be empty")]
    EmptyCertificateContent,

    #[error("password must be at least {min} characters")]
    ShortPassword { min: usize },

    #[error("malformed {field}: {cause}")]
    FormatError { field: &'static str, cause: String },

    #[error("digest verification failed")]
    BadDigest,

    #[error("digest verified before stream was fully read")]
    IncompleteRead,

    #[error("stream shorter than the trailer digest")]
    TrailerTooShort,

    #[error("unsupported key-protection algorithm {oid}")]
    UnsupportedAlgorithm { oid: String },

    #[error("wrong password")]
    BadPassword,

    #[error("malformed sealed object: missing field {field}")]
    MalformedSealedObject { field: &'static str },

    #[error("random source failed")]
    RandomSourceFailed,

    #[error(transparent)]
    Io(std::io::Error),
}

impl From<std::io::Error> for KeystoreError {
    fn from(e: std::io::Error) -> Self {
        if crate::digest::is_trailer_too_short(&e) {
            KeystoreError::TrailerTooShort
        } else {
            KeystoreError::Io(e)
        }
    }
}

pub type Result<T> = std::result::Result<T, KeystoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_human_readable() {
        assert_eq!(KeystoreError::BadPassword.to_string(), "wrong password");
        assert_eq!(
            KeystoreError::BadDigest.to_string(),
            "digest verification failed"
        );
        assert_eq!(
            KeystoreError::FormatError {
                field: "magic",
                cause: "unrecognized magic 0xdeadbeef".to_string(),
            }
            .to_string(),
            "malformed magic: unrecognized magic 0xdeadbeef"
        );
    }
}
