//! ML-KEM-768 (FIPS 203) over the RustCrypto `ml-kem` crate.
//!
//! Long-term keys are stored as their 64-byte `d || z` seed and expanded
//! deterministically. Per-connection keys come from the OS RNG.

use kem::{Decapsulate, Encapsulate};
use ml_kem::kem::{DecapsulationKey, EncapsulationKey};
use ml_kem::{EncodedSizeUser, KemCore, MlKem768, MlKem768Params, B32};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const ML_KEM_PUBLIC_KEY_LEN: usize = 1184;
pub const ML_KEM_SECRET_KEY_LEN: usize = 2400;
pub const ML_KEM_CIPHERTEXT_LEN: usize = 1088;
pub const ML_KEM_SHARED_SECRET_LEN: usize = 32;
pub const ML_KEM_SEED_LEN: usize = 64;

/// ML-KEM-768 key pair. The decapsulation key is zeroed on drop.
#[derive(Clone)]
pub struct MlKem768KeyPair {
    decapsulation_key_bytes: Zeroizing<[u8; ML_KEM_SECRET_KEY_LEN]>,
    encapsulation_key_bytes: [u8; ML_KEM_PUBLIC_KEY_LEN],
}

impl MlKem768KeyPair {
    /// Fresh key pair from the OS RNG.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        let (dk, ek) = MlKem768::generate(&mut rng);
        Self::from_keys(&dk, &ek)
    }

    /// Expand a 64-byte `d || z` seed into a key pair.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        CryptoError::check_len(ML_KEM_SEED_LEN, seed.len())?;
        let mut d = [0u8; 32];
        let mut z = [0u8; 32];
        d.copy_from_slice(&seed[..32]);
        z.copy_from_slice(&seed[32..]);
        let d = Zeroizing::new(d);
        let z = Zeroizing::new(z);
        let d: B32 = (*d).into();
        let z: B32 = (*z).into();
        let (dk, ek) = MlKem768::generate_deterministic(&d, &z);
        Ok(Self::from_keys(&dk, &ek))
    }

    fn from_keys(
        dk: &DecapsulationKey<MlKem768Params>,
        ek: &EncapsulationKey<MlKem768Params>,
    ) -> Self {
        let mut dk_bytes = Zeroizing::new([0u8; ML_KEM_SECRET_KEY_LEN]);
        let mut ek_bytes = [0u8; ML_KEM_PUBLIC_KEY_LEN];
        dk_bytes.copy_from_slice(&dk.as_bytes()[..]);
        ek_bytes.copy_from_slice(&ek.as_bytes()[..]);
        Self {
            decapsulation_key_bytes: dk_bytes,
            encapsulation_key_bytes: ek_bytes,
        }
    }

    pub fn encapsulation_key(&self) -> &[u8; ML_KEM_PUBLIC_KEY_LEN] {
        &self.encapsulation_key_bytes
    }

    /// Encapsulate a fresh shared secret to `recipient_public`.
    ///
    /// Returns the 1088-byte ciphertext and the 32-byte shared secret.
    pub fn encapsulate(
        recipient_public: &[u8],
    ) -> Result<(Vec<u8>, Zeroizing<[u8; ML_KEM_SHARED_SECRET_LEN]>), CryptoError> {
        let ek_bytes: &[u8; ML_KEM_PUBLIC_KEY_LEN] =
            recipient_public
                .try_into()
                .map_err(|_| CryptoError::InvalidLength {
                    expected: ML_KEM_PUBLIC_KEY_LEN,
                    actual: recipient_public.len(),
                })?;
        let encapsulation_key = EncapsulationKey::<MlKem768Params>::from_bytes(&(*ek_bytes).into());

        let mut rng = rand::rngs::OsRng;
        let (ciphertext, shared_secret) = encapsulation_key
            .encapsulate(&mut rng)
            .map_err(|_| CryptoError::EncapsulationFailed)?;

        let mut ss = Zeroizing::new([0u8; ML_KEM_SHARED_SECRET_LEN]);
        ss.copy_from_slice(&shared_secret[..]);
        Ok((ciphertext[..].to_vec(), ss))
    }

    /// Recover the shared secret from a 1088-byte ciphertext.
    ///
    /// ML-KEM decapsulation is implicitly rejecting: a tampered ciphertext
    /// yields an unrelated secret rather than an error.
    pub fn decapsulate(
        &self,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<[u8; ML_KEM_SHARED_SECRET_LEN]>, CryptoError> {
        let ct_bytes: &[u8; ML_KEM_CIPHERTEXT_LEN] =
            ciphertext
                .try_into()
                .map_err(|_| CryptoError::InvalidLength {
                    expected: ML_KEM_CIPHERTEXT_LEN,
                    actual: ciphertext.len(),
                })?;
        let decapsulation_key = DecapsulationKey::<MlKem768Params>::from_bytes(
            &(*self.decapsulation_key_bytes).into(),
        );
        let shared_secret = decapsulation_key
            .decapsulate(&(*ct_bytes).into())
            .map_err(|_| CryptoError::DecapsulationFailed)?;

        let mut ss = Zeroizing::new([0u8; ML_KEM_SHARED_SECRET_LEN]);
        ss.copy_from_slice(&shared_secret[..]);
        Ok(ss)
    }
}

impl std::fmt::Debug for MlKem768KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MlKem768KeyPair")
            .field("ek", &hex::encode(&self.encapsulation_key_bytes[..8]))
            .finish_non_exhaustive()
    }
}
