//! Pieces shared by the client and server handshakes: labels, message
//! layouts, key assembly and flight I/O.

use bytes::BytesMut;
use futures::StreamExt;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use zeroize::Zeroizing;

use crate::cipher::derive_key;
use crate::codec::{Record, RecordCodec, RecordType};
use crate::error::{Result, VlessError};
use crate::padding::{write_fragmented, PaddingConfig};
use crate::store::{Ticket, PFS_KEY_LEN, TICKET_LEN};
use crate::xor::ObfuscatedStream;

pub(crate) const NFS_C2S: &[u8] = b"vless-encryption nfs c2s";
pub(crate) const NFS_S2C: &[u8] = b"vless-encryption nfs s2c";
pub(crate) const DATA_C2S: &[u8] = b"vless-encryption data c2s";
pub(crate) const DATA_S2C: &[u8] = b"vless-encryption data s2c";
const TICKET_LABEL: &[u8] = b"vless-encryption ticket";

pub const IV_LEN: usize = 16;
pub const SALT_LEN: usize = 32;
/// Clear prefix before the relays: iv and cipher byte.
pub const PREFIX_LEN: usize = IV_LEN + 1;

pub(crate) const MLKEM_EK_LEN: usize = crypto::ml_kem::ML_KEM_PUBLIC_KEY_LEN;
pub(crate) const MLKEM_CT_LEN: usize = crypto::ml_kem::ML_KEM_CIPHERTEXT_LEN;
pub(crate) const X25519_LEN: usize = crypto::x25519::X25519_KEY_LEN;

/// Fresh client hello: encapsulation key, X25519 public, data salt.
pub(crate) const CLIENT_HELLO_LEN: usize = MLKEM_EK_LEN + X25519_LEN + SALT_LEN;
/// Fresh server hello: ciphertext, X25519 public, data salt.
pub(crate) const SERVER_HELLO_LEN: usize = MLKEM_CT_LEN + X25519_LEN + SALT_LEN;
/// Resume hello from the server: data salt plus filler to the fresh hello size.
pub(crate) const RESUME_FILLER_LEN: usize = SERVER_HELLO_LEN - SALT_LEN;
/// Client ticket hello: ticket, marker, data salt.
pub(crate) const TICKET_HELLO_LEN: usize = TICKET_LEN + crate::store::MARKER_LEN + SALT_LEN;
/// Server ticket record: ticket and lifetime in seconds.
pub(crate) const TICKET_RECORD_LEN: usize = TICKET_LEN + 4;

pub(crate) fn random_bytes(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    OsRng.fill_bytes(&mut out);
    out
}

pub(crate) fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// `pfs || nfs`: the secret behind both data ciphers.
pub(crate) fn united_key(
    pfs: &[u8; PFS_KEY_LEN],
    nfs: &[u8; 32],
) -> Zeroizing<[u8; PFS_KEY_LEN + 32]> {
    let mut united = Zeroizing::new([0u8; PFS_KEY_LEN + 32]);
    united[..PFS_KEY_LEN].copy_from_slice(pfs);
    united[PFS_KEY_LEN..].copy_from_slice(nfs);
    united
}

pub(crate) fn pfs_key(kem_ss: &[u8; 32], dh_ss: &[u8; 32]) -> Zeroizing<[u8; PFS_KEY_LEN]> {
    let mut pfs = Zeroizing::new([0u8; PFS_KEY_LEN]);
    pfs[..32].copy_from_slice(kem_ss);
    pfs[32..].copy_from_slice(dh_ss);
    pfs
}

pub(crate) fn derive_ticket(united: &[u8]) -> Result<Ticket> {
    let okm = derive_key(united, &[], &[TICKET_LABEL])?;
    let mut ticket = [0u8; TICKET_LEN];
    ticket.copy_from_slice(&okm[..TICKET_LEN]);
    Ok(ticket)
}

/// Plaintext with `padding` random bytes appended.
pub(crate) fn padded(fields: &[&[u8]], padding: usize) -> Vec<u8> {
    let len: usize = fields.iter().map(|f| f.len()).sum();
    let mut out = Vec::with_capacity(len + padding);
    for field in fields {
        out.extend_from_slice(field);
    }
    out.extend(random_bytes(padding));
    out
}

/// Short hex prefix for logs.
pub(crate) fn short_hex(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(4)])
}

pub(crate) async fn read_record<S>(
    framed: &mut Framed<ObfuscatedStream<S>, RecordCodec>,
) -> Result<Record>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(record) => record,
        None => Err(VlessError::Io(std::io::ErrorKind::UnexpectedEof.into())),
    }
}

/// Write `prefix` in the clear followed by masked `records`, shaped by `padding`.
pub(crate) async fn send_flight<S>(
    stream: &mut ObfuscatedStream<S>,
    prefix: &[u8],
    records: &[Record],
    padding: &PaddingConfig,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let records_len = records.iter().map(Record::wire_len).sum::<usize>();
    let mut flight = BytesMut::with_capacity(prefix.len() + records_len);
    flight.extend_from_slice(prefix);
    for record in records {
        record.write_to(&mut flight);
    }
    stream.mask_outbound(&mut flight[prefix.len()..]);
    let plan = padding.plan(flight.len(), &mut OsRng);
    write_fragmented(stream.get_mut(), &flight, &plan).await?;
    Ok(())
}

/// A `Hello` record of random bytes, the same size as a resume hello.
pub(crate) fn noise_record(padding: &PaddingConfig) -> Result<Record> {
    let len = crate::cipher::TAG_LEN + SERVER_HELLO_LEN + padding.padding_len(&mut OsRng);
    Record::noise(RecordType::Hello, len)
}
