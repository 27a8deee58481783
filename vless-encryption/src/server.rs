//! Server handshake

use std::sync::Arc;
use std::time::Duration;

use crypto::{EphemeralKeyPair, MlKem768KeyPair};
use rand::rngs::OsRng;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::cipher::{CipherKind, RecordCipher};
use crate::codec::{Record, RecordCodec, RecordType};
use crate::config::ServerOptions;
use crate::error::{Result, VlessError};
use crate::handshake::{
    derive_ticket, noise_record, padded, pfs_key, random_array, random_bytes, read_record,
    send_flight, short_hex, united_key, CLIENT_HELLO_LEN, DATA_C2S, DATA_S2C, IV_LEN,
    MLKEM_EK_LEN, NFS_C2S, NFS_S2C, PREFIX_LEN, RESUME_FILLER_LEN, SALT_LEN, TICKET_HELLO_LEN,
    X25519_LEN,
};
use crate::keychain::{cipher_mask, PrivateKeyChain};
use crate::session::SecureConn;
use crate::store::{Marker, SessionStore, Ticket, MARKER_LEN, TICKET_LEN};
use crate::xor::{ObfuscatedStream, Role};

type FramedConn<S> = Framed<ObfuscatedStream<S>, RecordCodec>;

/// Server side of the VLESS encryption handshake.
///
/// Owns the session store. When resumption is enabled a background task
/// sweeps expired sessions until [`ServerInstance::close`] is called or the
/// instance is dropped.
pub struct ServerInstance {
    chain: PrivateKeyChain,
    options: ServerOptions,
    store: Arc<SessionStore>,
}

impl ServerInstance {
    pub fn new(chain: PrivateKeyChain, options: ServerOptions) -> Result<Self> {
        options.validate()?;
        let store = Arc::new(SessionStore::new());
        if options.resumption_enabled() {
            SessionStore::spawn_sweeper(&store, options.sweep_interval);
        }
        Ok(Self {
            chain,
            options,
            store,
        })
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn chain(&self) -> &PrivateKeyChain {
        &self.chain
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Stop the session sweeper.
    pub fn close(&self) {
        self.store.close();
    }

    /// Run the handshake over `stream`.
    ///
    /// Failures before the first record are silent: the caller should drop
    /// the stream without responding. A failed resumption attempt is answered
    /// with noise shaped like a real resume hello, except for a replay, which
    /// gets no response at all.
    pub async fn handshake<S>(&self, stream: S) -> Result<SecureConn<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let obfuscate = self.options.obfuscation.is_enabled();
        let mut stream = ObfuscatedStream::new(stream);

        let mut head = [0u8; PREFIX_LEN];
        stream.read_exact(&mut head).await?;
        let iv = &head[..IV_LEN];
        let mut cipher_byte = head[IV_LEN];
        if obfuscate {
            cipher_byte ^= cipher_mask(self.chain.first_hash(), iv);
        }
        let kind = CipherKind::from_byte(cipher_byte).ok_or(VlessError::ProtocolViolation)?;

        let mut relays = vec![0u8; self.chain.relays_len()];
        stream.read_exact(&mut relays).await?;
        let nfs_key = self.chain.open_relays(iv, &relays, obfuscate)?;

        stream.enable(self.options.obfuscation, self.chain.first_hash(), iv, Role::Server);
        let mut nfs_c2s = RecordCipher::derive(kind, &nfs_key[..], iv, NFS_C2S)?;
        let nfs_s2c = RecordCipher::derive(kind, &nfs_key[..], iv, NFS_S2C)?;

        let mut framed = Framed::new(stream, RecordCodec::new());
        let record = read_record(&mut framed).await?;
        match record.kind {
            RecordType::Hello => {
                let hello = record.open(&mut nfs_c2s)?;
                self.fresh(framed, kind, &hello, &nfs_key, nfs_s2c).await
            }
            RecordType::Ticket => {
                self.resume(framed, kind, &record, &nfs_key, nfs_c2s, nfs_s2c)
                    .await
            }
            RecordType::Data => Err(VlessError::ProtocolViolation),
        }
    }

    async fn fresh<S>(
        &self,
        mut framed: FramedConn<S>,
        kind: CipherKind,
        hello: &[u8],
        nfs_key: &[u8; 32],
        mut nfs_s2c: RecordCipher,
    ) -> Result<SecureConn<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if hello.len() < CLIENT_HELLO_LEN {
            return Err(VlessError::ProtocolViolation);
        }
        let (client_ek, rest) = hello.split_at(MLKEM_EK_LEN);
        let (client_public, rest) = rest.split_at(X25519_LEN);
        let client_salt = &rest[..SALT_LEN];

        let (ciphertext, kem_ss) = MlKem768KeyPair::encapsulate(client_ek)?;
        let eph = EphemeralKeyPair::generate();
        let eph_public = eph.public_key();
        let dh_ss = eph.diffie_hellman(client_public)?;
        let pfs = pfs_key(&kem_ss, &dh_ss);
        let united = united_key(&pfs, nfs_key);

        let salt: [u8; SALT_LEN] = random_array();
        let mut send = RecordCipher::derive(kind, &united[..], &salt, DATA_S2C)?;
        let recv = RecordCipher::derive(kind, &united[..], client_salt, DATA_C2S)?;

        let lifetime = match &self.options.ticket_lifetime {
            Some(range) => OsRng.gen_range(range.clone()),
            None => 0,
        };
        let ticket = derive_ticket(&united[..])?;
        if lifetime > 0 {
            self.store
                .insert(ticket, &pfs, Duration::from_secs(lifetime as u64));
        }

        let padding = &self.options.padding;
        let server_hello = Record::seal(
            RecordType::Hello,
            &mut nfs_s2c,
            &padded(
                &[ciphertext.as_slice(), &eph_public[..], &salt[..]],
                padding.padding_len(&mut OsRng),
            ),
        )?;
        let ticket_record = Record::seal(
            RecordType::Ticket,
            &mut send,
            &padded(
                &[&ticket[..], &lifetime.to_be_bytes()[..]],
                padding.padding_len(&mut OsRng),
            ),
        )?;
        send_flight(framed.get_mut(), &[], &[server_hello, ticket_record], padding).await?;

        if self.options.verbose_logging {
            debug!(
                ticket = %short_hex(&ticket),
                lifetime,
                cipher = ?kind,
                "handshake complete"
            );
        }
        Ok(SecureConn::new(framed, send, recv, false))
    }

    async fn resume<S>(
        &self,
        mut framed: FramedConn<S>,
        kind: CipherKind,
        record: &Record,
        nfs_key: &[u8; 32],
        mut nfs_c2s: RecordCipher,
        mut nfs_s2c: RecordCipher,
    ) -> Result<SecureConn<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (ticket, marker, client_salt) = match self.parse_ticket_hello(record, &mut nfs_c2s) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.send_noise(&mut framed).await?;
                return Err(e);
            }
        };

        let session = match self.store.lookup(&ticket) {
            Ok(session) => session,
            Err(e) => {
                warn!(ticket = %short_hex(&ticket), error = %e, "rejecting resumption");
                self.send_noise(&mut framed).await?;
                return Err(e);
            }
        };
        if let Err(e) = self.store.check_and_mark_replay(&session, marker) {
            warn!(ticket = %short_hex(&ticket), "replayed ticket hello");
            return Err(e);
        }

        let united = united_key(session.pfs_key(), nfs_key);
        let salt: [u8; SALT_LEN] = random_array();
        let send = RecordCipher::derive(kind, &united[..], &salt, DATA_S2C)?;
        let recv = RecordCipher::derive(kind, &united[..], &client_salt, DATA_C2S)?;

        let padding = &self.options.padding;
        let filler = random_bytes(RESUME_FILLER_LEN);
        let hello = Record::seal(
            RecordType::Hello,
            &mut nfs_s2c,
            &padded(&[&salt[..], &filler[..]], padding.padding_len(&mut OsRng)),
        )?;
        send_flight(framed.get_mut(), &[], &[hello], padding).await?;

        if self.options.verbose_logging {
            debug!(ticket = %short_hex(&ticket), "resumed session");
        }
        Ok(SecureConn::new(framed, send, recv, true))
    }

    fn parse_ticket_hello(
        &self,
        record: &Record,
        nfs_c2s: &mut RecordCipher,
    ) -> Result<(Ticket, Marker, [u8; SALT_LEN])> {
        let body = record.open(nfs_c2s)?;
        if !self.options.resumption_enabled() {
            return Err(VlessError::SessionNotFound);
        }
        if body.len() < TICKET_HELLO_LEN {
            return Err(VlessError::ProtocolViolation);
        }
        let mut ticket = [0u8; TICKET_LEN];
        let mut marker = [0u8; MARKER_LEN];
        let mut salt = [0u8; SALT_LEN];
        ticket.copy_from_slice(&body[..TICKET_LEN]);
        marker.copy_from_slice(&body[TICKET_LEN..TICKET_LEN + MARKER_LEN]);
        salt.copy_from_slice(&body[TICKET_LEN + MARKER_LEN..TICKET_HELLO_LEN]);
        Ok((ticket, marker, salt))
    }

    async fn send_noise<S>(&self, framed: &mut FramedConn<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let noise = noise_record(&self.options.padding)?;
        send_flight(framed.get_mut(), &[], &[noise], &self.options.padding).await
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        self.store.close();
    }
}

impl std::fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInstance")
            .field("chain", &self.chain)
            .field("options", &self.options)
            .field("sessions", &self.store.len())
            .finish()
    }
}
