//! Primitives for the VLESS encryption layer.
//!
//! Everything here is stateless: key pairs, one-shot exchanges, hashing and
//! the keystream used for masking. Protocol state lives in `vless-encryption`.

pub mod deterministic;
pub mod error;
pub mod hashes;
pub mod ml_kem;
pub mod x25519;

pub use error::CryptoError;
pub use hashes::{blake3_256, blake3_keyed, Keystream};
pub use ml_kem::MlKem768KeyPair;
pub use x25519::{EphemeralKeyPair, StaticKeyPair};
