//! Error types for the VLESS encryption layer

use std::io;

use thiserror::Error;

/// Errors that can occur during handshakes and record processing.
///
/// Display strings are fixed and never echo peer-controlled bytes.
#[derive(Debug, Error)]
pub enum VlessError {
    /// Cryptographic primitive failed
    #[error("crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    /// I/O error on the underlying stream
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Malformed record header, unknown record type or bad message shape
    #[error("protocol violation")]
    ProtocolViolation,

    /// A relay in the key chain failed its hash check or exchange
    #[error("key chain integrity check failed")]
    ChainIntegrity,

    /// AEAD open failed
    #[error("authentication failed")]
    Authentication,

    /// Resumption marker seen before for this ticket
    #[error("replay detected")]
    ReplayDetected,

    #[error("session expired")]
    SessionExpired,

    #[error("session not found")]
    SessionNotFound,

    /// Instance was built without the state it needs (e.g. an empty key chain)
    #[error("not initialized")]
    Uninitialized,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl VlessError {
    /// Recover a `VlessError` carried inside an `io::Error` from the stream surface.
    pub fn from_io(err: &io::Error) -> Option<&VlessError> {
        err.get_ref()?.downcast_ref::<VlessError>()
    }
}

impl From<VlessError> for io::Error {
    fn from(e: VlessError) -> Self {
        match e {
            VlessError::Io(inner) => inner,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Result type for VLESS encryption operations
pub type Result<T> = std::result::Result<T, VlessError>;
