use blake3::{Hasher as Blake3Hasher, OutputReader};

pub const HASH_LEN: usize = 32;

pub fn blake3_256(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake3Hasher::new();
    hasher.update(data);
    let mut out = [0u8; HASH_LEN];
    hasher.finalize_xof().fill(&mut out);
    out
}

/// Keyed blake3, used to bind a derived secret to the bytes that produced it.
pub fn blake3_keyed(key: &[u8; 32], data: &[u8]) -> [u8; HASH_LEN] {
    *blake3::keyed_hash(key, data).as_bytes()
}

/// XOR keystream over the blake3 keyed-hash XOF.
///
/// The stream for `(key, iv, context)` is `blake3_keyed(key, len(context) || context || iv)`
/// read as an extendable output. Two streams with the same inputs produce the
/// same bytes, so masking and unmasking are the same call.
pub struct Keystream {
    reader: OutputReader,
    position: u64,
}

impl Keystream {
    pub fn new(key: &[u8; 32], iv: &[u8], context: &[u8]) -> Self {
        let mut hasher = Blake3Hasher::new_keyed(key);
        hasher.update(&(context.len() as u64).to_be_bytes());
        hasher.update(context);
        hasher.update(iv);
        Self {
            reader: hasher.finalize_xof(),
            position: 0,
        }
    }

    /// XOR the next `data.len()` keystream bytes into `data`.
    pub fn apply(&mut self, data: &mut [u8]) {
        let mut block = [0u8; 64];
        for chunk in data.chunks_mut(block.len()) {
            let pad = &mut block[..chunk.len()];
            self.reader.fill(pad);
            for (byte, k) in chunk.iter_mut().zip(pad.iter()) {
                *byte ^= k;
            }
        }
        self.position += data.len() as u64;
    }

    /// Number of keystream bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl std::fmt::Debug for Keystream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keystream")
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keystream_is_an_involution() {
        let key = [7u8; 32];
        let mut data = b"attack at dawn, bring snacks".to_vec();
        let original = data.clone();
        Keystream::new(&key, b"iv", b"ctx").apply(&mut data);
        assert_ne!(data, original);
        Keystream::new(&key, b"iv", b"ctx").apply(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn keystream_split_application_matches_whole() {
        let key = [1u8; 32];
        let mut whole = vec![0u8; 300];
        Keystream::new(&key, b"iv", b"ctx").apply(&mut whole);

        let mut split = vec![0u8; 300];
        let mut stream = Keystream::new(&key, b"iv", b"ctx");
        let (a, rest) = split.split_at_mut(5);
        let (b, c) = rest.split_at_mut(131);
        stream.apply(a);
        stream.apply(b);
        stream.apply(c);
        assert_eq!(whole, split);
        assert_eq!(stream.position(), 300);
    }

    #[test]
    fn keystream_depends_on_every_input() {
        let mut base = [0u8; 32];
        Keystream::new(&[1u8; 32], b"iv", b"ctx").apply(&mut base);
        for (key, iv, ctx) in [
            ([2u8; 32], &b"iv"[..], &b"ctx"[..]),
            ([1u8; 32], &b"iw"[..], &b"ctx"[..]),
            ([1u8; 32], &b"iv"[..], &b"cty"[..]),
        ] {
            let mut other = [0u8; 32];
            Keystream::new(&key, iv, ctx).apply(&mut other);
            assert_ne!(base, other);
        }
    }

    #[test]
    fn keyed_hash_depends_on_key() {
        assert_ne!(blake3_keyed(&[0u8; 32], b"relay"), blake3_keyed(&[1u8; 32], b"relay"));
        assert_ne!(blake3_keyed(&[0u8; 32], b"relay"), blake3_256(b"relay"));
    }

    #[test]
    fn blake3_matches_reference() {
        assert_eq!(
            hex::encode(blake3_256(b"")),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }
}
