//! X25519 key agreement.

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const X25519_KEY_LEN: usize = 32;

fn parse_public(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    let arr: [u8; X25519_KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidLength {
        expected: X25519_KEY_LEN,
        actual: bytes.len(),
    })?;
    Ok(PublicKey::from(arr))
}

fn finish(shared: SharedSecret) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }
    Ok(Zeroizing::new(shared.to_bytes()))
}

/// Long-term X25519 key pair.
#[derive(Clone)]
pub struct StaticKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl StaticKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Load a key pair from 32 raw private key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; X25519_KEY_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                expected: X25519_KEY_LEN,
                actual: bytes.len(),
            })?;
        let arr = Zeroizing::new(arr);
        let secret = StaticSecret::from(*arr);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public_key(&self) -> [u8; X25519_KEY_LEN] {
        self.public.to_bytes()
    }

    pub fn diffie_hellman(&self, peer: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let peer = parse_public(peer)?;
        finish(self.secret.diffie_hellman(&peer))
    }
}

impl std::fmt::Debug for StaticKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Single-use X25519 key pair. Consumed by the exchange.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; X25519_KEY_LEN] {
        self.public.to_bytes()
    }

    pub fn diffie_hellman(self, peer: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let peer = parse_public(peer)?;
        finish(self.secret.diffie_hellman(&peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_and_ephemeral_agree() {
        let server = StaticKeyPair::generate();
        let client = EphemeralKeyPair::generate();
        let client_public = client.public_key();
        let a = client.diffie_hellman(&server.public_key()).unwrap();
        let b = server.diffie_hellman(&client_public).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn from_bytes_is_stable() {
        let a = StaticKeyPair::from_bytes(&[9u8; 32]).unwrap();
        let b = StaticKeyPair::from_bytes(&[9u8; 32]).unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert!(StaticKeyPair::from_bytes(&[9u8; 31]).is_err());
    }

    #[test]
    fn low_order_point_is_rejected() {
        let server = StaticKeyPair::generate();
        assert_eq!(
            server.diffie_hellman(&[0u8; 32]).unwrap_err(),
            CryptoError::NonContributory
        );
    }
}
