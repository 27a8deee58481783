//! Encrypted connection established after a successful handshake

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::codec::Framed;
use zeroize::Zeroizing;

use crate::cipher::{CipherKind, RecordCipher};
use crate::client::ResumeGuard;
use crate::codec::{Record, RecordCodec, RecordType};
use crate::error::{Result, VlessError};
use crate::handshake::{DATA_S2C, SALT_LEN, SERVER_HELLO_LEN};
use crate::xor::ObfuscatedStream;

/// Plaintext bytes sealed per record on write.
pub const MAX_WRITE_CHUNK: usize = 8192;

/// Receive side of a 0-RTT client before the server's resume hello arrives.
pub(crate) struct PendingResume {
    pub(crate) nfs_s2c: RecordCipher,
    pub(crate) united: Zeroizing<[u8; 96]>,
    pub(crate) guard: Option<ResumeGuard>,
}

impl PendingResume {
    fn complete(&mut self, record: &Record) -> Result<RecordCipher> {
        if record.kind != RecordType::Hello {
            return Err(VlessError::ProtocolViolation);
        }
        let hello = record.open(&mut self.nfs_s2c)?;
        if hello.len() < SERVER_HELLO_LEN {
            return Err(VlessError::ProtocolViolation);
        }
        RecordCipher::derive(
            self.nfs_s2c.kind(),
            &self.united[..],
            &hello[..SALT_LEN],
            DATA_S2C,
        )
    }

    fn fail(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.invalidate();
        }
    }
}

enum ReadState {
    Ready(RecordCipher),
    AwaitingResumeHello(Box<PendingResume>),
    Failed,
}

/// A secure, encrypted connection.
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]. Each write seals at most
/// [`MAX_WRITE_CHUNK`] bytes into one record; each read returns bytes from one
/// record and keeps the rest for the next read.
pub struct SecureConn<S> {
    framed: Framed<ObfuscatedStream<S>, RecordCodec>,
    send: RecordCipher,
    recv: ReadState,
    read_buf: Bytes,
    cipher: CipherKind,
    resumed: bool,
    bytes_sent: u64,
    bytes_received: u64,
}

impl<S> SecureConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        framed: Framed<ObfuscatedStream<S>, RecordCodec>,
        send: RecordCipher,
        recv: RecordCipher,
        resumed: bool,
    ) -> Self {
        Self::with_state(framed, send, ReadState::Ready(recv), resumed)
    }

    pub(crate) fn resuming(
        framed: Framed<ObfuscatedStream<S>, RecordCodec>,
        send: RecordCipher,
        pending: PendingResume,
    ) -> Self {
        Self::with_state(framed, send, ReadState::AwaitingResumeHello(Box::new(pending)), true)
    }

    fn with_state(
        framed: Framed<ObfuscatedStream<S>, RecordCodec>,
        send: RecordCipher,
        recv: ReadState,
        resumed: bool,
    ) -> Self {
        Self {
            framed,
            cipher: send.kind(),
            send,
            recv,
            read_buf: Bytes::new(),
            resumed,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Whether this connection was resumed from a session ticket
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn cipher(&self) -> CipherKind {
        self.cipher
    }

    /// Plaintext bytes sent
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Plaintext bytes received
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn get_ref(&self) -> &S {
        self.framed.get_ref().get_ref()
    }

    /// Turn the next record into plaintext in `read_buf`, or report EOF.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<Result<bool>> {
        loop {
            if matches!(self.recv, ReadState::Failed) {
                return Poll::Ready(Err(VlessError::Authentication));
            }
            let next = ready!(Pin::new(&mut self.framed).poll_next(cx));
            match &mut self.recv {
                ReadState::Failed => return Poll::Ready(Err(VlessError::Authentication)),
                ReadState::AwaitingResumeHello(pending) => {
                    let outcome = match next {
                        Some(Ok(record)) => pending.complete(&record),
                        Some(Err(e)) => Err(e),
                        None => Err(VlessError::Io(io::ErrorKind::UnexpectedEof.into())),
                    };
                    match outcome {
                        Ok(cipher) => self.recv = ReadState::Ready(cipher),
                        Err(e) => {
                            pending.fail();
                            self.recv = ReadState::Failed;
                            return Poll::Ready(Err(e));
                        }
                    }
                }
                ReadState::Ready(cipher) => {
                    let record = match next {
                        Some(Ok(record)) => record,
                        Some(Err(e)) => return Poll::Ready(Err(e)),
                        None => return Poll::Ready(Ok(false)),
                    };
                    if record.kind != RecordType::Data {
                        return Poll::Ready(Err(VlessError::ProtocolViolation));
                    }
                    let plaintext = record.open(cipher)?;
                    self.bytes_received += plaintext.len() as u64;
                    self.read_buf = Bytes::from(plaintext);
                    return Poll::Ready(Ok(true));
                }
            }
        }
    }
}

impl<S> AsyncRead for SecureConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        while this.read_buf.is_empty() {
            if !ready!(this.poll_fill(cx))? {
                return Poll::Ready(Ok(()));
            }
        }
        let n = buf.remaining().min(this.read_buf.len());
        buf.put_slice(&this.read_buf[..n]);
        this.read_buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncWrite for SecureConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(Pin::new(&mut this.framed).poll_ready(cx))?;
        let n = buf.len().min(MAX_WRITE_CHUNK);
        let record = Record::seal(RecordType::Data, &mut this.send, &buf[..n])?;
        Pin::new(&mut this.framed).start_send(record)?;
        this.bytes_sent += n as u64;
        // push it towards the wire; a pending flush finishes on the next call
        if let Poll::Ready(Err(e)) = Pin::new(&mut this.framed).poll_flush(cx) {
            return Poll::Ready(Err(e.into()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().framed)
            .poll_flush(cx)
            .map_err(Into::into)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().framed)
            .poll_close(cx)
            .map_err(Into::into)
    }
}

impl<S> std::fmt::Debug for SecureConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureConn")
            .field("cipher", &self.cipher)
            .field("resumed", &self.resumed)
            .field("bytes_sent", &self.bytes_sent)
            .field("bytes_received", &self.bytes_received)
            .finish_non_exhaustive()
    }
}
