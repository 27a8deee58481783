//! Stream obfuscation: XOR masking of record headers or of the whole stream.
//!
//! The wrapper is transparent until [`ObfuscatedStream::enable`] is called,
//! which lets the handshake read and write the clear prefix through it. From
//! then on each direction keeps its own keystream. In header mode it also
//! tracks record boundaries so that only the five header bytes of each record
//! are masked, however the bytes are split across reads and writes.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use crypto::Keystream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::codec::HEADER_LEN;

const C2S: &[u8] = b"vless-encryption obfs c2s";
const S2C: &[u8] = b"vless-encryption obfs s2c";

/// What the obfuscation layer hides.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ObfuscationMode {
    /// Records go out as-is
    #[default]
    None,
    /// Only record headers are masked; bodies pass through untouched
    Header,
    /// Every byte after the clear prefix is masked
    Full,
}

impl ObfuscationMode {
    pub fn is_enabled(self) -> bool {
        self != ObfuscationMode::None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Masking state for one direction.
#[derive(Debug)]
struct Direction {
    mode: ObfuscationMode,
    keystream: Option<Keystream>,
    /// Masked bytes are clear on this side after masking (false) or before (true)
    outbound: bool,
    header: [u8; HEADER_LEN],
    header_seen: usize,
    body_left: usize,
}

impl Direction {
    fn passthrough(outbound: bool) -> Self {
        Self {
            mode: ObfuscationMode::None,
            keystream: None,
            outbound,
            header: [0u8; HEADER_LEN],
            header_seen: 0,
            body_left: 0,
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        let Some(keystream) = self.keystream.as_mut() else {
            return;
        };
        match self.mode {
            ObfuscationMode::None => {}
            ObfuscationMode::Full => keystream.apply(data),
            ObfuscationMode::Header => {
                let mut pos = 0;
                while pos < data.len() {
                    if self.body_left > 0 {
                        let skip = self.body_left.min(data.len() - pos);
                        self.body_left -= skip;
                        pos += skip;
                        continue;
                    }
                    let take = (HEADER_LEN - self.header_seen).min(data.len() - pos);
                    let chunk = &mut data[pos..pos + take];
                    if self.outbound {
                        self.header[self.header_seen..self.header_seen + take]
                            .copy_from_slice(chunk);
                        keystream.apply(chunk);
                    } else {
                        keystream.apply(chunk);
                        self.header[self.header_seen..self.header_seen + take]
                            .copy_from_slice(chunk);
                    }
                    self.header_seen += take;
                    pos += take;
                    if self.header_seen == HEADER_LEN {
                        self.header_seen = 0;
                        self.body_left =
                            u16::from_be_bytes([self.header[3], self.header[4]]) as usize;
                    }
                }
            }
        }
    }

    fn is_active(&self) -> bool {
        self.keystream.is_some() && self.mode.is_enabled()
    }
}

/// Byte stream wrapper that applies [`ObfuscationMode`] masking.
#[derive(Debug)]
pub struct ObfuscatedStream<S> {
    inner: S,
    inbound: Direction,
    outbound: Direction,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S> ObfuscatedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            inbound: Direction::passthrough(false),
            outbound: Direction::passthrough(true),
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    /// Start masking. `key` is the first chain entry's hash, `iv` the client's.
    pub fn enable(&mut self, mode: ObfuscationMode, key: &[u8; 32], iv: &[u8], role: Role) {
        if !mode.is_enabled() {
            return;
        }
        let (send_label, recv_label) = match role {
            Role::Client => (C2S, S2C),
            Role::Server => (S2C, C2S),
        };
        self.outbound.mode = mode;
        self.outbound.keystream = Some(Keystream::new(key, iv, send_label));
        self.inbound.mode = mode;
        self.inbound.keystream = Some(Keystream::new(key, iv, recv_label));
    }

    /// Mask bytes that the caller will write to [`Self::get_mut`] itself.
    ///
    /// Advances the outbound state exactly as if `data` had gone through
    /// `poll_write`. Nothing may be pending when this is used.
    pub fn mask_outbound(&mut self, data: &mut [u8]) {
        debug_assert!(self.pending_pos >= self.pending.len());
        self.outbound.apply(data);
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// The raw stream. Bytes written here bypass masking.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S: AsyncWrite + Unpin> ObfuscatedStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ObfuscatedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.inbound.apply(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ObfuscatedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if !this.outbound.is_active() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        // Masking advances the keystream, so once masked the bytes are ours to deliver.
        this.pending.extend_from_slice(buf);
        this.outbound.apply(&mut this.pending[..]);
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
