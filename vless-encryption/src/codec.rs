//! Record framing: `[type:1][magic:2][length:2 BE][ciphertext]`

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::cipher::{RecordCipher, TAG_LEN};
use crate::error::{Result, VlessError};

pub const HEADER_LEN: usize = 5;
/// Smallest body: one plaintext byte plus the tag.
pub const MIN_RECORD_LEN: usize = TAG_LEN + 1;
pub const MAX_RECORD_LEN: usize = 17_000;
/// Largest plaintext that fits in one record.
pub const MAX_PLAINTEXT_LEN: usize = MAX_RECORD_LEN - TAG_LEN;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordType {
    Ticket,
    Hello,
    Data,
}

impl RecordType {
    fn type_byte(self) -> u8 {
        match self {
            RecordType::Ticket => 0x14,
            RecordType::Hello => 0x16,
            RecordType::Data => 0x17,
        }
    }

    fn magic(self) -> [u8; 2] {
        match self {
            RecordType::Hello => [0x03, 0x01],
            RecordType::Ticket | RecordType::Data => [0x03, 0x03],
        }
    }

    /// Header for a body of `len` bytes. Fails if `len` is out of range.
    pub fn header(self, len: usize) -> Result<[u8; HEADER_LEN]> {
        if !(MIN_RECORD_LEN..=MAX_RECORD_LEN).contains(&len) {
            return Err(VlessError::ProtocolViolation);
        }
        let magic = self.magic();
        let len = (len as u16).to_be_bytes();
        Ok([self.type_byte(), magic[0], magic[1], len[0], len[1]])
    }

    /// Validate a header and return its type and body length.
    pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(RecordType, usize)> {
        let kind = match header[0] {
            0x14 => RecordType::Ticket,
            0x16 => RecordType::Hello,
            0x17 => RecordType::Data,
            _ => return Err(VlessError::ProtocolViolation),
        };
        if header[1..3] != kind.magic() {
            return Err(VlessError::ProtocolViolation);
        }
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if !(MIN_RECORD_LEN..=MAX_RECORD_LEN).contains(&len) {
            return Err(VlessError::ProtocolViolation);
        }
        Ok((kind, len))
    }
}

/// A framed record. `body` is ciphertext (or noise).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordType,
    pub header: [u8; HEADER_LEN],
    pub body: Bytes,
}

impl Record {
    /// Seal `plaintext` into a record of the given type. The header is the AAD.
    pub fn seal(kind: RecordType, cipher: &mut RecordCipher, plaintext: &[u8]) -> Result<Self> {
        let header = kind.header(plaintext.len() + TAG_LEN)?;
        let body = cipher.seal(&header, plaintext)?;
        Ok(Self {
            kind,
            header,
            body: Bytes::from(body),
        })
    }

    /// A record of `len` random bytes under a valid header.
    pub fn noise(kind: RecordType, len: usize) -> Result<Self> {
        let header = kind.header(len)?;
        Ok(Self {
            kind,
            header,
            body: Bytes::from(crate::handshake::random_bytes(len)),
        })
    }

    pub fn open(&self, cipher: &mut RecordCipher) -> Result<Vec<u8>> {
        cipher.open(&self.header, &self.body)
    }

    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_len());
        dst.put_slice(&self.header);
        dst.put_slice(&self.body);
    }
}

/// Codec for [`Record`]s over a byte stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecordCodec {
    _priv: (),
}

impl RecordCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for RecordCodec {
    type Item = Record;
    type Error = VlessError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Record>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let (kind, len) = RecordType::parse_header(&header)?;
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let body = src.split_to(len).freeze();
        Ok(Some(Record { kind, header, body }))
    }
}

impl Encoder<Record> for RecordCodec {
    type Error = VlessError;

    fn encode(&mut self, item: Record, dst: &mut BytesMut) -> Result<()> {
        item.write_to(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherKind;

    #[test]
    fn header_layout() {
        assert_eq!(
            RecordType::Data.header(0x0123).unwrap(),
            [0x17, 0x03, 0x03, 0x01, 0x23]
        );
        assert_eq!(
            RecordType::Hello.header(17).unwrap(),
            [0x16, 0x03, 0x01, 0x00, 0x11]
        );
        assert!(RecordType::Data.header(16).is_err());
        assert!(RecordType::Data.header(17_001).is_err());
    }

    #[test]
    fn decode_waits_for_full_record() {
        let mut codec = RecordCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x17, 0x03, 0x03, 0x00, 20]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(&[0xAA; 19]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(&[0xAA; 1]);
        buf.put_slice(&[0x17]);
        let record = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(record.kind, RecordType::Data);
        assert_eq!(record.body.len(), 20);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn bogus_headers_are_violations() {
        let cases: [[u8; 5]; 5] = [
            [0x15, 0x03, 0x03, 0x00, 0x20], // unknown type
            [0x17, 0x03, 0x01, 0x00, 0x20], // data with hello magic
            [0x16, 0x03, 0x03, 0x00, 0x20], // hello with data magic
            [0x17, 0x03, 0x03, 0x00, 0x10], // too short
            [0x17, 0x03, 0x03, 0x42, 0x69], // 17001
        ];
        for header in cases {
            let mut buf = BytesMut::from(&header[..]);
            assert!(
                matches!(
                    RecordCodec::new().decode(&mut buf),
                    Err(VlessError::ProtocolViolation)
                ),
                "header {:02x?} accepted",
                header
            );
        }
    }

    #[test]
    fn sealed_record_decodes_and_opens() {
        let mut sealer =
            RecordCipher::derive(CipherKind::Aes256Gcm, &[1u8; 32], b"s", b"t").unwrap();
        let mut opener =
            RecordCipher::derive(CipherKind::Aes256Gcm, &[1u8; 32], b"s", b"t").unwrap();
        let record = Record::seal(RecordType::Ticket, &mut sealer, b"ticket body").unwrap();

        let mut buf = BytesMut::new();
        RecordCodec::new().encode(record.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), record.wire_len());

        let decoded = RecordCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.open(&mut opener).unwrap(), b"ticket body");
    }

    #[test]
    fn tampered_header_fails_authentication() {
        let mut sealer =
            RecordCipher::derive(CipherKind::Aes256Gcm, &[1u8; 32], b"s", b"t").unwrap();
        let mut opener =
            RecordCipher::derive(CipherKind::Aes256Gcm, &[1u8; 32], b"s", b"t").unwrap();
        let mut record = Record::seal(RecordType::Data, &mut sealer, b"payload").unwrap();
        // still a valid header, but not the one that was sealed
        record.header[0] = 0x14;
        assert!(matches!(
            record.open(&mut opener),
            Err(VlessError::Authentication)
        ));
    }

    #[test]
    fn oversized_plaintext_is_rejected() {
        let mut sealer =
            RecordCipher::derive(CipherKind::Aes256Gcm, &[1u8; 32], b"s", b"t").unwrap();
        let max = vec![0u8; MAX_PLAINTEXT_LEN];
        assert!(Record::seal(RecordType::Data, &mut sealer, &max).is_ok());
        let over = vec![0u8; MAX_PLAINTEXT_LEN + 1];
        assert!(Record::seal(RecordType::Data, &mut sealer, &over).is_err());
    }
}
