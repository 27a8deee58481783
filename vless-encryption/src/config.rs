//! Client and server options, and the compact config-string format.
//!
//! ```text
//! server: mlkem768x25519plus.<native|xorpub|random>.<secs>[-<secs>]s[.<pad>...].<key>[.<key>...]
//! client: mlkem768x25519plus.<native|xorpub|random>.<0rtt|1rtt>[.<pad>...].<key>[.<key>...]
//! ```
//!
//! Padding directives are segments shorter than 20 characters: `p<min>-<max>`
//! (padding bytes), `f<min>-<max>` (fragment bytes), `g<min>-<max>` (gap in
//! milliseconds) and `n<count>` (max fragments). Keys are unpadded base64url.

use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::cipher::CipherKind;
use crate::error::{Result, VlessError};
use crate::keychain::{NfsPrivateKey, NfsPublicKey, PrivateKeyChain, PublicKeyChain};
use crate::padding::PaddingConfig;
use crate::xor::ObfuscationMode;

pub const SCHEME: &str = "mlkem768x25519plus";

const DIRECTIVE_MAX_LEN: usize = 20;

/// Options for [`crate::ClientInstance`]
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// AEAD used for every record on the connection
    pub cipher: CipherKind,
    /// Must match the server
    pub obfuscation: ObfuscationMode,
    /// Cache tickets and resume with 0-RTT
    pub zero_rtt: bool,
    pub padding: PaddingConfig,
    /// Whether to log detailed handshake information
    pub verbose_logging: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            cipher: CipherKind::default(),
            obfuscation: ObfuscationMode::None,
            zero_rtt: true,
            padding: PaddingConfig::default(),
            verbose_logging: false,
        }
    }
}

impl ClientOptions {
    pub fn with_cipher(mut self, cipher: CipherKind) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_obfuscation(mut self, mode: ObfuscationMode) -> Self {
        self.obfuscation = mode;
        self
    }

    pub fn with_zero_rtt(mut self, enabled: bool) -> Self {
        self.zero_rtt = enabled;
        self
    }

    pub fn with_padding(mut self, padding: PaddingConfig) -> Self {
        self.padding = padding;
        self
    }

    /// Enable verbose logging
    pub fn with_verbose_logging(mut self) -> Self {
        self.verbose_logging = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.padding.validate()
    }
}

/// Options for [`crate::ServerInstance`]
#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub obfuscation: ObfuscationMode,
    /// Ticket lifetime in seconds, drawn per handshake; `None` disables resumption
    pub ticket_lifetime: Option<RangeInclusive<u32>>,
    pub padding: PaddingConfig,
    /// How often expired sessions are swept
    pub sweep_interval: Duration,
    /// Whether to log detailed handshake information
    pub verbose_logging: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            obfuscation: ObfuscationMode::None,
            ticket_lifetime: Some(300..=600),
            padding: PaddingConfig::default(),
            sweep_interval: Duration::from_secs(60),
            verbose_logging: false,
        }
    }
}

impl ServerOptions {
    pub fn with_obfuscation(mut self, mode: ObfuscationMode) -> Self {
        self.obfuscation = mode;
        self
    }

    pub fn with_ticket_lifetime(mut self, lifetime: Option<RangeInclusive<u32>>) -> Self {
        self.ticket_lifetime = lifetime;
        self
    }

    pub fn with_padding(mut self, padding: PaddingConfig) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Enable verbose logging
    pub fn with_verbose_logging(mut self) -> Self {
        self.verbose_logging = true;
        self
    }

    pub fn resumption_enabled(&self) -> bool {
        matches!(&self.ticket_lifetime, Some(range) if *range.end() > 0)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(range) = &self.ticket_lifetime {
            if range.start() > range.end() {
                return Err(VlessError::InvalidConfig("ticket lifetime min exceeds max".into()));
            }
        }
        if self.sweep_interval.is_zero() {
            return Err(VlessError::InvalidConfig("sweep interval must be positive".into()));
        }
        self.padding.validate()
    }
}

/// Encode key bytes the way config strings carry them.
pub fn encode_key(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn decode_key(segment: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| VlessError::InvalidConfig("key is not valid base64url".into()))
}

fn invalid(msg: &str) -> VlessError {
    VlessError::InvalidConfig(msg.to_string())
}

fn parse_range(value: &str, what: &str) -> Result<(u64, u64)> {
    let number = |s: &str| {
        s.parse::<u64>()
            .map_err(|_| VlessError::InvalidConfig(format!("invalid {} value", what)))
    };
    let (min, max) = match value.split_once('-') {
        Some((a, b)) => (number(a)?, number(b)?),
        None => {
            let v = number(value)?;
            (v, v)
        }
    };
    if min > max {
        return Err(VlessError::InvalidConfig(format!("{} min exceeds max", what)));
    }
    Ok((min, max))
}

fn apply_directive(padding: &mut PaddingConfig, directive: &str) -> Result<()> {
    let (tag, value) = directive.split_at(directive.chars().next().map_or(0, char::len_utf8));
    match tag {
        "p" => {
            let (min, max) = parse_range(value, "padding")?;
            padding.padding = min as usize..=max as usize;
        }
        "f" => {
            let (min, max) = parse_range(value, "fragment")?;
            padding.fragment = min as usize..=max as usize;
            if padding.max_fragments <= 1 {
                padding.max_fragments = PaddingConfig::default().max_fragments;
            }
        }
        "g" => {
            let (min, max) = parse_range(value, "gap")?;
            padding.gap = Duration::from_millis(min)..=Duration::from_millis(max);
        }
        "n" => {
            let (count, _) = parse_range(value, "fragment count")?;
            padding.max_fragments = count as usize;
        }
        _ => return Err(invalid("unknown padding directive")),
    }
    Ok(())
}

/// Split the common `scheme.mode.<third>[.directives].keys` layout.
fn split_config(s: &str) -> Result<(ObfuscationMode, &str, PaddingConfig, Vec<Vec<u8>>)> {
    let mut parts = s.trim().split('.');
    if parts.next() != Some(SCHEME) {
        return Err(invalid("unsupported scheme"));
    }
    let mode = match parts.next() {
        Some("native") => ObfuscationMode::None,
        Some("xorpub") => ObfuscationMode::Header,
        Some("random") => ObfuscationMode::Full,
        _ => return Err(invalid("mode must be native, xorpub or random")),
    };
    let third = parts.next().ok_or_else(|| invalid("missing ticket field"))?;

    let mut padding = PaddingConfig::default();
    let mut keys = Vec::new();
    for segment in parts {
        if segment.len() < DIRECTIVE_MAX_LEN {
            if !keys.is_empty() {
                return Err(invalid("padding directives must precede keys"));
            }
            apply_directive(&mut padding, segment)?;
        } else {
            keys.push(decode_key(segment)?);
        }
    }
    if keys.is_empty() {
        return Err(VlessError::Uninitialized);
    }
    padding.validate()?;
    Ok((mode, third, padding, keys))
}

/// Parsed client config string
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub chain: PublicKeyChain,
    pub options: ClientOptions,
}

impl FromStr for ClientConfig {
    type Err = VlessError;

    fn from_str(s: &str) -> Result<Self> {
        let (obfuscation, rtt, padding, keys) = split_config(s)?;
        let zero_rtt = match rtt {
            "0rtt" => true,
            "1rtt" => false,
            _ => return Err(invalid("client ticket field must be 0rtt or 1rtt")),
        };
        let keys = keys
            .iter()
            .map(|k| NfsPublicKey::from_bytes(k))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            chain: PublicKeyChain::new(keys)?,
            options: ClientOptions {
                obfuscation,
                zero_rtt,
                padding,
                ..ClientOptions::default()
            },
        })
    }
}

/// Parsed server config string
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub chain: PrivateKeyChain,
    pub options: ServerOptions,
}

impl FromStr for ServerConfig {
    type Err = VlessError;

    fn from_str(s: &str) -> Result<Self> {
        let (obfuscation, lifetime, padding, keys) = split_config(s)?;
        let secs = lifetime
            .strip_suffix('s')
            .ok_or_else(|| invalid("server ticket field must end in s"))?;
        let (min, max) = parse_range(secs, "ticket lifetime")?;
        let max = u32::try_from(max).map_err(|_| invalid("ticket lifetime too long"))?;
        let ticket_lifetime = (max > 0).then(|| min as u32..=max);
        let keys = keys
            .iter()
            .map(|k| NfsPrivateKey::from_bytes(k))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            chain: PrivateKeyChain::new(keys)?,
            options: ServerOptions {
                obfuscation,
                ticket_lifetime,
                padding,
                ..ServerOptions::default()
            },
        })
    }
}
