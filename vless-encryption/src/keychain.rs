//! Long-term ("NFS") key chains and the chained relay exchange.
//!
//! A chain is an ordered list of X25519 or ML-KEM-768 keys. The client runs
//! one exchange per entry and sends the relays back to back:
//!
//! ```text
//! relay_0 || hash_1 || relay_1 || ... || hash_{N-1} || relay_{N-1}
//! ```
//!
//! For `j > 0` the first 64 bytes of `hash_j || relay_j` are masked with a
//! keystream keyed by the link of entry `j - 1`, the keyed hash of its
//! shared secret over its relay bytes. Only a server that completed exchange
//! `j - 1` can unmask and check `hash_j`, so a chain cannot be entered in the
//! middle and no relay can be altered without failing the next check. The
//! handshake secret is the link of the final entry.

use crypto::hashes::{blake3_256, blake3_keyed, Keystream};
use crypto::ml_kem::{ML_KEM_CIPHERTEXT_LEN, ML_KEM_PUBLIC_KEY_LEN, ML_KEM_SEED_LEN};
use crypto::x25519::X25519_KEY_LEN;
use crypto::{EphemeralKeyPair, MlKem768KeyPair, StaticKeyPair};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{Result, VlessError};

pub const HASH_LEN: usize = 32;

const RELAY_MASK: &[u8] = b"vless-encryption relay";
const CHAIN_MASK: &[u8] = b"vless-encryption chain";
const CIPHER_MASK: &[u8] = b"vless-encryption cipher";

/// Public half of a chain entry, as configured on the client.
#[derive(Clone, PartialEq, Eq)]
pub enum NfsPublicKey {
    X25519([u8; X25519_KEY_LEN]),
    MlKem768(Box<[u8; ML_KEM_PUBLIC_KEY_LEN]>),
}

impl NfsPublicKey {
    /// Parse by length: 32 bytes is X25519, 1184 bytes is an ML-KEM-768 encapsulation key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            X25519_KEY_LEN => {
                let mut key = [0u8; X25519_KEY_LEN];
                key.copy_from_slice(bytes);
                Ok(NfsPublicKey::X25519(key))
            }
            ML_KEM_PUBLIC_KEY_LEN => {
                let mut key = Box::new([0u8; ML_KEM_PUBLIC_KEY_LEN]);
                key.copy_from_slice(bytes);
                Ok(NfsPublicKey::MlKem768(key))
            }
            n => Err(VlessError::InvalidConfig(format!(
                "public key must be {} or {} bytes, got {}",
                X25519_KEY_LEN, ML_KEM_PUBLIC_KEY_LEN, n
            ))),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            NfsPublicKey::X25519(key) => key,
            NfsPublicKey::MlKem768(key) => &key[..],
        }
    }

    /// Bytes this entry contributes to the relay section.
    pub fn relay_len(&self) -> usize {
        match self {
            NfsPublicKey::X25519(_) => X25519_KEY_LEN,
            NfsPublicKey::MlKem768(_) => ML_KEM_CIPHERTEXT_LEN,
        }
    }

    pub fn hash(&self) -> [u8; HASH_LEN] {
        blake3_256(self.as_bytes())
    }

    /// Run the client side of the exchange: returns the relay and the shared secret.
    fn exchange(&self) -> Result<(Vec<u8>, Zeroizing<[u8; 32]>)> {
        match self {
            NfsPublicKey::X25519(server) => {
                let eph = EphemeralKeyPair::generate();
                let relay = eph.public_key().to_vec();
                let secret = eph.diffie_hellman(server)?;
                Ok((relay, secret))
            }
            NfsPublicKey::MlKem768(server) => Ok(MlKem768KeyPair::encapsulate(&server[..])?),
        }
    }
}

impl std::fmt::Debug for NfsPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            NfsPublicKey::X25519(_) => "X25519",
            NfsPublicKey::MlKem768(_) => "MlKem768",
        };
        write!(f, "{}({})", kind, hex::encode(&self.hash()[..8]))
    }
}

/// Private half of a chain entry, as configured on the server.
#[derive(Clone, Debug)]
pub enum NfsPrivateKey {
    X25519(StaticKeyPair),
    MlKem768(MlKem768KeyPair),
}

impl NfsPrivateKey {
    /// Parse by length: 32 bytes is an X25519 private key, 64 bytes an ML-KEM-768 seed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            X25519_KEY_LEN => Ok(NfsPrivateKey::X25519(StaticKeyPair::from_bytes(bytes)?)),
            ML_KEM_SEED_LEN => Ok(NfsPrivateKey::MlKem768(MlKem768KeyPair::from_seed(bytes)?)),
            n => Err(VlessError::InvalidConfig(format!(
                "private key must be {} or {} bytes, got {}",
                X25519_KEY_LEN, ML_KEM_SEED_LEN, n
            ))),
        }
    }

    pub fn public_key(&self) -> NfsPublicKey {
        match self {
            NfsPrivateKey::X25519(kp) => NfsPublicKey::X25519(kp.public_key()),
            NfsPrivateKey::MlKem768(kp) => {
                NfsPublicKey::MlKem768(Box::new(*kp.encapsulation_key()))
            }
        }
    }

    fn relay_len(&self) -> usize {
        match self {
            NfsPrivateKey::X25519(_) => X25519_KEY_LEN,
            NfsPrivateKey::MlKem768(_) => ML_KEM_CIPHERTEXT_LEN,
        }
    }

    fn exchange(&self, relay: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        Ok(match self {
            NfsPrivateKey::X25519(kp) => kp.diffie_hellman(relay)?,
            NfsPrivateKey::MlKem768(kp) => kp.decapsulate(relay)?,
        })
    }
}

fn link(secret: &[u8; 32], relay: &[u8]) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(blake3_keyed(secret, relay))
}

fn relays_len(lens: impl ExactSizeIterator<Item = usize>) -> usize {
    let count = lens.len();
    lens.sum::<usize>() + HASH_LEN * count.saturating_sub(1)
}

/// Mask for the cipher byte in the clear prefix.
pub(crate) fn cipher_mask(hash0: &[u8; HASH_LEN], iv: &[u8]) -> u8 {
    let mut byte = [0u8; 1];
    Keystream::new(hash0, iv, CIPHER_MASK).apply(&mut byte);
    byte[0]
}

/// Client-side chain.
#[derive(Clone, Debug)]
pub struct PublicKeyChain {
    keys: Vec<NfsPublicKey>,
    hashes: Vec<[u8; HASH_LEN]>,
}

impl PublicKeyChain {
    pub fn new(keys: Vec<NfsPublicKey>) -> Result<Self> {
        if keys.is_empty() {
            return Err(VlessError::Uninitialized);
        }
        let hashes = keys.iter().map(NfsPublicKey::hash).collect();
        Ok(Self { keys, hashes })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[NfsPublicKey] {
        &self.keys
    }

    /// Hash of the first entry; keys the obfuscation layer.
    pub fn first_hash(&self) -> &[u8; HASH_LEN] {
        &self.hashes[0]
    }

    pub fn relays_len(&self) -> usize {
        relays_len(self.keys.iter().map(NfsPublicKey::relay_len))
    }

    /// Run every exchange and build the relay section.
    ///
    /// Returns the relay bytes and the handshake secret.
    pub fn seal_relays(
        &self,
        iv: &[u8],
        obfuscate: bool,
    ) -> Result<(Vec<u8>, Zeroizing<[u8; 32]>)> {
        let mut out = Vec::with_capacity(self.relays_len());
        let mut prev: Option<Zeroizing<[u8; 32]>> = None;
        for (key, hash) in self.keys.iter().zip(&self.hashes) {
            let (mut relay, secret) = key.exchange()?;
            if obfuscate {
                Keystream::new(hash, iv, RELAY_MASK).apply(&mut relay);
            }
            let next = link(&secret, &relay);
            match prev {
                None => out.extend_from_slice(&relay),
                Some(prev_link) => {
                    let start = out.len();
                    out.extend_from_slice(hash);
                    out.extend_from_slice(&relay);
                    Keystream::new(&prev_link, iv, CHAIN_MASK)
                        .apply(&mut out[start..start + 2 * HASH_LEN]);
                }
            }
            prev = Some(next);
        }
        prev.ok_or(VlessError::Uninitialized)
            .map(|secret| (out, secret))
    }
}

/// Server-side chain.
#[derive(Clone, Debug)]
pub struct PrivateKeyChain {
    keys: Vec<NfsPrivateKey>,
    hashes: Vec<[u8; HASH_LEN]>,
}

impl PrivateKeyChain {
    pub fn new(keys: Vec<NfsPrivateKey>) -> Result<Self> {
        if keys.is_empty() {
            return Err(VlessError::Uninitialized);
        }
        let hashes = keys.iter().map(|k| k.public_key().hash()).collect();
        Ok(Self { keys, hashes })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The chain a client needs to talk to this server.
    pub fn public_chain(&self) -> PublicKeyChain {
        PublicKeyChain {
            keys: self.keys.iter().map(NfsPrivateKey::public_key).collect(),
            hashes: self.hashes.clone(),
        }
    }

    pub fn first_hash(&self) -> &[u8; HASH_LEN] {
        &self.hashes[0]
    }

    pub fn relays_len(&self) -> usize {
        relays_len(self.keys.iter().map(NfsPrivateKey::relay_len))
    }

    /// Verify and complete every exchange in `relays`.
    ///
    /// Any hash mismatch or primitive failure is reported as
    /// [`VlessError::ChainIntegrity`] without saying which entry failed.
    pub fn open_relays(
        &self,
        iv: &[u8],
        relays: &[u8],
        obfuscate: bool,
    ) -> Result<Zeroizing<[u8; 32]>> {
        if relays.len() != self.relays_len() {
            return Err(VlessError::ChainIntegrity);
        }
        let mut pos = 0;
        let mut prev: Option<Zeroizing<[u8; 32]>> = None;
        for (key, hash) in self.keys.iter().zip(&self.hashes) {
            let relay_len = key.relay_len();
            let mut relay = match prev.as_ref() {
                None => {
                    let relay = relays[pos..pos + relay_len].to_vec();
                    pos += relay_len;
                    relay
                }
                Some(prev_link) => {
                    let mut segment = relays[pos..pos + HASH_LEN + relay_len].to_vec();
                    pos += HASH_LEN + relay_len;
                    Keystream::new(prev_link, iv, CHAIN_MASK).apply(&mut segment[..2 * HASH_LEN]);
                    if !bool::from(segment[..HASH_LEN].ct_eq(&hash[..])) {
                        return Err(VlessError::ChainIntegrity);
                    }
                    segment.split_off(HASH_LEN)
                }
            };
            let next_link_input = relay.clone();
            if obfuscate {
                Keystream::new(hash, iv, RELAY_MASK).apply(&mut relay);
            }
            let secret = key.exchange(&relay).map_err(|_| VlessError::ChainIntegrity)?;
            prev = Some(link(&secret, &next_link_input));
        }
        prev.ok_or(VlessError::Uninitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::deterministic::expand_array;

    fn x25519(label: &[u8]) -> NfsPrivateKey {
        NfsPrivateKey::from_bytes(&expand_array::<32>(b"keychain-test", label)).unwrap()
    }

    fn mlkem(label: &[u8]) -> NfsPrivateKey {
        NfsPrivateKey::from_bytes(&expand_array::<64>(b"keychain-test", label)).unwrap()
    }

    fn chains() -> Vec<PrivateKeyChain> {
        vec![
            PrivateKeyChain::new(vec![x25519(b"a")]).unwrap(),
            PrivateKeyChain::new(vec![mlkem(b"b")]).unwrap(),
            PrivateKeyChain::new(vec![x25519(b"c"), mlkem(b"d"), x25519(b"e")]).unwrap(),
        ]
    }

    #[test]
    fn key_lengths_select_algorithm() {
        assert!(matches!(x25519(b"x"), NfsPrivateKey::X25519(_)));
        assert!(matches!(mlkem(b"x"), NfsPrivateKey::MlKem768(_)));
        assert!(NfsPrivateKey::from_bytes(&[0u8; 48]).is_err());

        let public = mlkem(b"x").public_key();
        assert_eq!(public.as_bytes().len(), ML_KEM_PUBLIC_KEY_LEN);
        assert_eq!(NfsPublicKey::from_bytes(public.as_bytes()).unwrap(), public);
        assert!(NfsPublicKey::from_bytes(&[0u8; 64]).is_err());
    }

    #[test]
    fn empty_chain_is_uninitialized() {
        assert!(matches!(PublicKeyChain::new(vec![]), Err(VlessError::Uninitialized)));
        assert!(matches!(PrivateKeyChain::new(vec![]), Err(VlessError::Uninitialized)));
    }

    #[test]
    fn relay_length_accounts_for_hashes() {
        let chain = PrivateKeyChain::new(vec![x25519(b"c"), mlkem(b"d"), x25519(b"e")]).unwrap();
        assert_eq!(chain.relays_len(), 32 + (32 + 1088) + (32 + 32));
        assert_eq!(chain.public_chain().relays_len(), chain.relays_len());
    }

    #[test]
    fn both_sides_derive_the_same_secret() {
        let iv = [7u8; 16];
        for server in chains() {
            for obfuscate in [false, true] {
                let client = server.public_chain();
                let (relays, client_secret) = client.seal_relays(&iv, obfuscate).unwrap();
                assert_eq!(relays.len(), server.relays_len());
                let server_secret = server.open_relays(&iv, &relays, obfuscate).unwrap();
                assert_eq!(*client_secret, *server_secret);
            }
        }
    }

    #[test]
    fn wrong_iv_breaks_the_chain() {
        let server = PrivateKeyChain::new(vec![x25519(b"c"), x25519(b"e")]).unwrap();
        let (relays, _) = server.public_chain().seal_relays(&[1u8; 16], false).unwrap();
        assert!(matches!(
            server.open_relays(&[2u8; 16], &relays, false),
            Err(VlessError::ChainIntegrity)
        ));
    }

    #[test]
    fn chain_order_matters() {
        let server = PrivateKeyChain::new(vec![x25519(b"c"), x25519(b"e")]).unwrap();
        let swapped = PublicKeyChain::new(vec![
            x25519(b"e").public_key(),
            x25519(b"c").public_key(),
        ])
        .unwrap();
        let (relays, _) = swapped.seal_relays(&[1u8; 16], false).unwrap();
        assert!(server.open_relays(&[1u8; 16], &relays, false).is_err());
    }

    #[test]
    fn cipher_mask_depends_on_iv() {
        let hash = [3u8; 32];
        let masks: Vec<u8> = (0..16u8).map(|i| cipher_mask(&hash, &[i; 16])).collect();
        assert!(masks.iter().any(|m| *m != masks[0]));
    }
}
