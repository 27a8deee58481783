//! AEAD record ciphers with a nonce-exhaustion ratchet

use aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{Result, VlessError};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const MAX_NONCE: [u8; NONCE_LEN] = [0xFF; NONCE_LEN];

/// AEAD algorithm, announced by the client in the clear prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CipherKind {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    pub fn as_byte(self) -> u8 {
        match self {
            CipherKind::Aes256Gcm => 0x01,
            CipherKind::ChaCha20Poly1305 => 0x02,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(CipherKind::Aes256Gcm),
            0x02 => Some(CipherKind::ChaCha20Poly1305),
            _ => None,
        }
    }
}

impl Default for CipherKind {
    fn default() -> Self {
        CipherKind::Aes256Gcm
    }
}

/// HKDF-SHA256 into a 32-byte key.
pub(crate) fn derive_key(
    secret: &[u8],
    salt: &[u8],
    info: &[&[u8]],
) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand_multi_info(info, &mut okm[..])
        .map_err(|_| VlessError::Crypto(crypto::CryptoError::InvalidKey))?;
    Ok(okm)
}

enum AeadImpl {
    Aes(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

impl AeadImpl {
    fn new(kind: CipherKind, key: &[u8; KEY_LEN]) -> Result<Self> {
        let invalid = |_| VlessError::Crypto(crypto::CryptoError::InvalidKey);
        Ok(match kind {
            CipherKind::Aes256Gcm => AeadImpl::Aes(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(invalid)?,
            )),
            CipherKind::ChaCha20Poly1305 => AeadImpl::ChaCha(Box::new(
                ChaCha20Poly1305::new_from_slice(key).map_err(invalid)?,
            )),
        })
    }

    fn seal(&self, nonce: &[u8; NONCE_LEN], payload: Payload<'_, '_>) -> Option<Vec<u8>> {
        match self {
            AeadImpl::Aes(c) => c.encrypt(aes_gcm::Nonce::from_slice(nonce), payload).ok(),
            AeadImpl::ChaCha(c) => c
                .encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                .ok(),
        }
    }

    fn open(&self, nonce: &[u8; NONCE_LEN], payload: Payload<'_, '_>) -> Option<Vec<u8>> {
        match self {
            AeadImpl::Aes(c) => c.decrypt(aes_gcm::Nonce::from_slice(nonce), payload).ok(),
            AeadImpl::ChaCha(c) => c
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                .ok(),
        }
    }
}

/// One direction of an AEAD channel.
///
/// The nonce is a 96-bit big-endian counter. After the record sealed or
/// opened at the all-ones nonce, the key is re-derived from the base secret
/// with that record's ciphertext as salt and its header in the info, and the
/// counter wraps to zero.
pub struct RecordCipher {
    kind: CipherKind,
    aead: AeadImpl,
    secret: Zeroizing<Vec<u8>>,
    label: &'static [u8],
    nonce: [u8; NONCE_LEN],
    rekeys: u64,
}

impl RecordCipher {
    /// Key a cipher from `secret`, `salt` and a direction label.
    pub fn derive(
        kind: CipherKind,
        secret: &[u8],
        salt: &[u8],
        label: &'static [u8],
    ) -> Result<Self> {
        let key = derive_key(secret, salt, &[label, &[kind.as_byte()]])?;
        Ok(Self {
            kind,
            aead: AeadImpl::new(kind, &key)?,
            secret: Zeroizing::new(secret.to_vec()),
            label,
            nonce: [0u8; NONCE_LEN],
            rekeys: 0,
        })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Current nonce (for debugging/testing)
    pub fn nonce(&self) -> [u8; NONCE_LEN] {
        self.nonce
    }

    /// Number of ratchet steps taken so far
    pub fn rekeys(&self) -> u64 {
        self.rekeys
    }

    /// Encrypt `plaintext` with `aad` bound in, then advance the nonce.
    pub fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = self
            .aead
            .seal(&self.nonce, Payload { msg: plaintext, aad })
            .ok_or(VlessError::Crypto(crypto::CryptoError::InvalidKey))?;
        self.advance(aad, &ciphertext)?;
        Ok(ciphertext)
    }

    /// Decrypt `ciphertext` with `aad` bound in, then advance the nonce.
    pub fn open(&mut self, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plaintext = self
            .aead
            .open(&self.nonce, Payload { msg: ciphertext, aad })
            .ok_or(VlessError::Authentication)?;
        self.advance(aad, ciphertext)?;
        Ok(plaintext)
    }

    fn advance(&mut self, aad: &[u8], ciphertext: &[u8]) -> Result<()> {
        if self.nonce == MAX_NONCE {
            let key = derive_key(&self.secret, ciphertext, &[self.label, aad])?;
            self.aead = AeadImpl::new(self.kind, &key)?;
            self.nonce = [0u8; NONCE_LEN];
            self.rekeys += 1;
            return Ok(());
        }
        increment_nonce(&mut self.nonce);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_nonce(&mut self, nonce: [u8; NONCE_LEN]) {
        self.nonce = nonce;
    }
}

impl std::fmt::Debug for RecordCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCipher")
            .field("kind", &self.kind)
            .field("label", &String::from_utf8_lossy(self.label))
            .field("nonce", &hex::encode(self.nonce))
            .finish_non_exhaustive()
    }
}

fn increment_nonce(nonce: &mut [u8; NONCE_LEN]) {
    for byte in nonce.iter_mut().rev() {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            break;
        }
    }
}
