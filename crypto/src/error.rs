use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid length: expected {expected} bytes, found {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid key")]
    InvalidKey,

    /// The peer's point produced an all-zero shared secret.
    #[error("non-contributory key exchange")]
    NonContributory,

    #[error("encapsulation failed")]
    EncapsulationFailed,

    #[error("decapsulation failed")]
    DecapsulationFailed,
}

impl CryptoError {
    pub(crate) fn check_len(expected: usize, actual: usize) -> Result<(), Self> {
        if expected != actual {
            return Err(CryptoError::InvalidLength { expected, actual });
        }
        Ok(())
    }
}
