use blake3::Hasher;

/// Expand the provided input into a deterministic byte vector of the requested length.
///
/// `domain` separates unrelated uses of the same input. The output is a
/// blake3 XOF stream, so any prefix of a longer expansion equals the shorter one.
pub fn expand_to_length(domain: &[u8], input: &[u8], length: usize) -> Vec<u8> {
    let mut output = vec![0u8; length];
    expand_into(domain, input, &mut output);
    output
}

/// Fixed-size variant of [`expand_to_length`].
pub fn expand_array<const N: usize>(domain: &[u8], input: &[u8]) -> [u8; N] {
    let mut output = [0u8; N];
    expand_into(domain, input, &mut output);
    output
}

fn expand_into(domain: &[u8], input: &[u8], out: &mut [u8]) {
    let mut hasher = Hasher::new();
    hasher.update(&(domain.len() as u64).to_be_bytes());
    hasher.update(domain);
    hasher.update(input);
    hasher.finalize_xof().fill(out);
}
