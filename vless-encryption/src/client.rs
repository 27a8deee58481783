//! Client handshake and ticket cache

use std::sync::Arc;
use std::time::Duration;

use crypto::{EphemeralKeyPair, MlKem768KeyPair};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::debug;
use zeroize::Zeroizing;

use crate::cipher::RecordCipher;
use crate::codec::{Record, RecordCodec, RecordType};
use crate::config::ClientOptions;
use crate::error::{Result, VlessError};
use crate::handshake::{
    padded, pfs_key, random_array, read_record, send_flight, short_hex, united_key, DATA_C2S,
    DATA_S2C, IV_LEN, MLKEM_CT_LEN, NFS_C2S, NFS_S2C, PREFIX_LEN, SALT_LEN, SERVER_HELLO_LEN,
    TICKET_RECORD_LEN, X25519_LEN,
};
use crate::keychain::{cipher_mask, PublicKeyChain};
use crate::session::{PendingResume, SecureConn};
use crate::store::{Marker, Ticket, PFS_KEY_LEN, TICKET_LEN};
use crate::xor::{ObfuscatedStream, Role};

struct CachedTicket {
    ticket: Ticket,
    pfs_key: Zeroizing<[u8; PFS_KEY_LEN]>,
    expire: Instant,
}

/// Single-slot cache of the most recent ticket.
#[derive(Default)]
pub(crate) struct TicketCache {
    slot: RwLock<Option<CachedTicket>>,
}

impl TicketCache {
    fn get(&self) -> Option<(Ticket, Zeroizing<[u8; PFS_KEY_LEN]>)> {
        let slot = self.slot.read();
        let cached = slot.as_ref()?;
        if Instant::now() >= cached.expire {
            return None;
        }
        Some((cached.ticket, cached.pfs_key.clone()))
    }

    fn store(&self, ticket: Ticket, pfs_key: &[u8; PFS_KEY_LEN], valid_for: Duration) {
        *self.slot.write() = Some(CachedTicket {
            ticket,
            pfs_key: Zeroizing::new(*pfs_key),
            expire: Instant::now() + valid_for,
        });
    }

    /// Clear the slot if it still holds `ticket`.
    fn invalidate(&self, ticket: &Ticket) {
        let mut slot = self.slot.write();
        if slot.as_ref().is_some_and(|cached| &cached.ticket == ticket) {
            *slot = None;
        }
    }

    fn clear(&self) {
        *self.slot.write() = None;
    }
}

/// Drops the presented ticket from the cache if the resumed connection fails.
pub(crate) struct ResumeGuard {
    cache: Arc<TicketCache>,
    ticket: Ticket,
}

impl ResumeGuard {
    pub(crate) fn invalidate(self) {
        self.cache.invalidate(&self.ticket);
    }
}

/// The client lifetime of a ticket: four fifths of what the server grants.
fn client_validity(lifetime_secs: u32) -> Duration {
    Duration::from_secs(lifetime_secs as u64) * 4 / 5
}

/// Client side of the VLESS encryption handshake.
///
/// One instance serves any number of connections to the same server and
/// shares its ticket cache between them.
pub struct ClientInstance {
    chain: PublicKeyChain,
    options: ClientOptions,
    tickets: Arc<TicketCache>,
}

impl ClientInstance {
    pub fn new(chain: PublicKeyChain, options: ClientOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            chain,
            options,
            tickets: Arc::new(TicketCache::default()),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Whether an unexpired ticket is cached
    pub fn has_ticket(&self) -> bool {
        self.tickets.get().is_some()
    }

    /// Forget the cached ticket; the next handshake is a fresh one.
    pub fn clear_ticket(&self) {
        self.tickets.clear();
    }

    /// Run the handshake over `stream`.
    ///
    /// With a cached ticket and 0-RTT enabled this returns as soon as the
    /// first flight is written; the server's reply is consumed by the first
    /// read. Otherwise it waits for the server's hello and ticket.
    pub async fn handshake<S>(&self, stream: S) -> Result<SecureConn<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let obfuscate = self.options.obfuscation.is_enabled();
        let iv: [u8; IV_LEN] = random_array();
        let kind = self.options.cipher;

        let (relays, nfs_key) = self.chain.seal_relays(&iv, obfuscate)?;
        let mut prefix = Vec::with_capacity(PREFIX_LEN + relays.len());
        prefix.extend_from_slice(&iv);
        let mut cipher_byte = kind.as_byte();
        if obfuscate {
            cipher_byte ^= cipher_mask(self.chain.first_hash(), &iv);
        }
        prefix.push(cipher_byte);
        prefix.extend_from_slice(&relays);

        let mut stream = ObfuscatedStream::new(stream);
        stream.enable(self.options.obfuscation, self.chain.first_hash(), &iv, Role::Client);

        let nfs_c2s = RecordCipher::derive(kind, &nfs_key[..], &iv, NFS_C2S)?;
        let nfs_s2c = RecordCipher::derive(kind, &nfs_key[..], &iv, NFS_S2C)?;

        if self.options.zero_rtt {
            if let Some((ticket, pfs)) = self.tickets.get() {
                return self
                    .resume(stream, &prefix, ticket, &pfs, &nfs_key, nfs_c2s, nfs_s2c)
                    .await;
            }
        }
        self.fresh(stream, &prefix, &nfs_key, nfs_c2s, nfs_s2c).await
    }

    async fn resume<S>(
        &self,
        mut stream: ObfuscatedStream<S>,
        prefix: &[u8],
        ticket: Ticket,
        pfs: &[u8; PFS_KEY_LEN],
        nfs_key: &[u8; 32],
        mut nfs_c2s: RecordCipher,
        nfs_s2c: RecordCipher,
    ) -> Result<SecureConn<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let guard = ResumeGuard {
            cache: self.tickets.clone(),
            ticket,
        };
        let marker: Marker = random_array();
        let salt: [u8; SALT_LEN] = random_array();
        let pad = self.options.padding.padding_len(&mut OsRng);
        let hello = Record::seal(
            RecordType::Ticket,
            &mut nfs_c2s,
            &padded(&[&ticket[..], &marker[..], &salt[..]], pad),
        )?;
        if let Err(e) = send_flight(&mut stream, prefix, &[hello], &self.options.padding).await {
            guard.invalidate();
            return Err(e);
        }

        let united = united_key(pfs, nfs_key);
        let send = RecordCipher::derive(self.options.cipher, &united[..], &salt, DATA_C2S)?;
        if self.options.verbose_logging {
            debug!(ticket = %short_hex(&ticket), "sent 0-RTT ticket hello");
        }
        Ok(SecureConn::resuming(
            Framed::new(stream, RecordCodec::new()),
            send,
            PendingResume {
                nfs_s2c,
                united,
                guard: Some(guard),
            },
        ))
    }

    async fn fresh<S>(
        &self,
        mut stream: ObfuscatedStream<S>,
        prefix: &[u8],
        nfs_key: &[u8; 32],
        mut nfs_c2s: RecordCipher,
        mut nfs_s2c: RecordCipher,
    ) -> Result<SecureConn<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let kem = MlKem768KeyPair::generate();
        let eph = EphemeralKeyPair::generate();
        let salt: [u8; SALT_LEN] = random_array();
        let pad = self.options.padding.padding_len(&mut OsRng);
        let hello = Record::seal(
            RecordType::Hello,
            &mut nfs_c2s,
            &padded(
                &[&kem.encapsulation_key()[..], &eph.public_key()[..], &salt[..]],
                pad,
            ),
        )?;
        send_flight(&mut stream, prefix, &[hello], &self.options.padding).await?;
        if self.options.verbose_logging {
            debug!(relays = self.chain.len(), "sent client hello");
        }

        let mut framed = Framed::new(stream, RecordCodec::new());
        let record = read_record(&mut framed).await?;
        if record.kind != RecordType::Hello {
            return Err(VlessError::ProtocolViolation);
        }
        let server_hello = record.open(&mut nfs_s2c)?;
        if server_hello.len() < SERVER_HELLO_LEN {
            return Err(VlessError::ProtocolViolation);
        }
        let (ciphertext, rest) = server_hello.split_at(MLKEM_CT_LEN);
        let (server_public, rest) = rest.split_at(X25519_LEN);
        let server_salt = &rest[..SALT_LEN];

        let kem_ss = kem.decapsulate(ciphertext)?;
        let dh_ss = eph.diffie_hellman(server_public)?;
        let pfs = pfs_key(&kem_ss, &dh_ss);
        let united = united_key(&pfs, nfs_key);

        let mut recv =
            RecordCipher::derive(self.options.cipher, &united[..], server_salt, DATA_S2C)?;
        let send = RecordCipher::derive(self.options.cipher, &united[..], &salt, DATA_C2S)?;

        // Opening the ticket record is the server's key confirmation.
        let record = read_record(&mut framed).await?;
        if record.kind != RecordType::Ticket {
            return Err(VlessError::ProtocolViolation);
        }
        let ticket_body = record.open(&mut recv)?;
        if ticket_body.len() < TICKET_RECORD_LEN {
            return Err(VlessError::ProtocolViolation);
        }
        let mut ticket = [0u8; TICKET_LEN];
        ticket.copy_from_slice(&ticket_body[..TICKET_LEN]);
        let lifetime = u32::from_be_bytes([
            ticket_body[TICKET_LEN],
            ticket_body[TICKET_LEN + 1],
            ticket_body[TICKET_LEN + 2],
            ticket_body[TICKET_LEN + 3],
        ]);

        if self.options.zero_rtt && lifetime > 0 {
            self.tickets.store(ticket, &pfs, client_validity(lifetime));
        }
        if self.options.verbose_logging {
            debug!(
                ticket = %short_hex(&ticket),
                lifetime,
                "handshake complete"
            );
        }
        Ok(SecureConn::new(framed, send, recv, false))
    }
}

impl std::fmt::Debug for ClientInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInstance")
            .field("chain", &self.chain)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
