//! VLESS encryption layer
//!
//! This crate turns any byte stream into an authenticated, forward-secret,
//! replay-resistant channel. It combines:
//! - A chain of long-term X25519 / ML-KEM-768 keys that authenticate the server
//! - A per-connection hybrid ML-KEM-768 + X25519 exchange for forward secrecy
//! - Session tickets for 0-RTT resumption, with single-use markers
//!
//! # Protocol Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           Fresh handshake                           │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │ C → S  iv ‖ cipher ‖ relays ‖ Hello{ek ‖ x25519 ‖ salt ‖ pad}         │
//! │ S → C  Hello{ct ‖ x25519 ‖ salt ‖ pad} ‖ Ticket{ticket ‖ lifetime}    │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                         Resumed (0-RTT)                             │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │ C → S  iv ‖ cipher ‖ relays ‖ Ticket{ticket ‖ marker ‖ salt ‖ pad}    │
//! │        ‖ Data...                                                    │
//! │ S → C  Hello{salt ‖ filler ‖ pad} ‖ Data...                          │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Hello records and the client's ticket record are sealed with keys from the
//! relay chain. Data records, and the server's ticket record, use keys from
//! `pfs ‖ nfs`, so recording traffic and later stealing the long-term keys
//! does not reveal fresh sessions.
//!
//! # Example
//!
//! ```rust,ignore
//! use vless_encryption::{ClientConfig, ClientInstance};
//!
//! let config: ClientConfig = encryption_string.parse()?;
//! let client = ClientInstance::new(config.chain, config.options)?;
//!
//! let mut conn = client.handshake(tcp_stream).await?;
//! conn.write_all(b"Hello, quantum world!").await?;
//! ```

pub mod cipher;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handshake;
pub mod keychain;
pub mod padding;
pub mod server;
pub mod session;
pub mod store;
pub mod xor;

pub use cipher::CipherKind;
pub use client::ClientInstance;
pub use config::{ClientConfig, ClientOptions, ServerConfig, ServerOptions};
pub use error::{Result, VlessError};
pub use keychain::{NfsPrivateKey, NfsPublicKey, PrivateKeyChain, PublicKeyChain};
pub use padding::PaddingConfig;
pub use server::ServerInstance;
pub use session::SecureConn;
pub use store::SessionStore;
pub use xor::ObfuscationMode;
