//! End-to-end handshakes over in-memory streams

mod common;

use common::*;
use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt};
use vless_encryption::{
    CipherKind, ClientInstance, ClientOptions, ObfuscationMode, PaddingConfig, ServerInstance,
    ServerOptions, VlessError,
};

const SIZES: [usize; 5] = [0, 1, 8191, 8193, 100_000];

#[tokio::test]
async fn every_chain_cipher_and_mode_carries_data() {
    init_tracing();
    for (name, chain) in chains() {
        for cipher in [CipherKind::Aes256Gcm, CipherKind::ChaCha20Poly1305] {
            for mode in [ObfuscationMode::None, ObfuscationMode::Header, ObfuscationMode::Full] {
                let server = server(chain.clone(), ServerOptions::default().with_obfuscation(mode));
                let client = client_for(
                    &server,
                    ClientOptions::default()
                        .with_cipher(cipher)
                        .with_obfuscation(mode),
                );
                let (mut c, mut s) = connect(&client, &server).await;
                assert!(!c.is_resumed(), "{name} {cipher:?} {mode:?}");
                assert_eq!(c.cipher(), cipher);
                assert_eq!(s.cipher(), cipher);
                for len in SIZES {
                    exchange(&mut c, &mut s, len).await;
                }
                let total: u64 = SIZES.iter().map(|&n| n as u64).sum();
                assert_eq!(c.bytes_sent(), total);
                assert_eq!(s.bytes_received(), total);
            }
        }
    }
}

#[tokio::test]
async fn fresh_handshake_issues_a_ticket() {
    let (_, chain) = chains().remove(0);
    let server = server(chain, ServerOptions::default());
    let client = client_for(&server, ClientOptions::default());
    assert!(!client.has_ticket());
    let (mut c, mut s) = connect(&client, &server).await;
    exchange(&mut c, &mut s, 64).await;
    assert!(client.has_ticket());
    assert_eq!(server.store().len(), 1);
}

#[tokio::test]
async fn disabled_resumption_issues_no_ticket() {
    let (_, chain) = chains().remove(0);
    let server = server(chain, ServerOptions::default().with_ticket_lifetime(None));
    let client = client_for(&server, ClientOptions::default());
    let (mut c, mut s) = connect(&client, &server).await;
    exchange(&mut c, &mut s, 64).await;
    assert!(!client.has_ticket());
    assert!(server.store().is_empty());

    let (c, _s) = connect(&client, &server).await;
    assert!(!c.is_resumed());
}

#[tokio::test]
async fn unknown_record_type_is_rejected() {
    let (_, chain) = chains().remove(0);
    let server = server(chain, ServerOptions::default());
    let stranger = x25519_key("stranger").public_key();

    let mut flight = vec![0x42u8; 16];
    flight.push(CipherKind::Aes256Gcm.as_byte());
    flight.extend_from_slice(stranger.as_bytes());
    flight.extend_from_slice(&[0x99, 0x03, 0x03, 0x00, 0x20]);
    flight.extend_from_slice(&[0u8; 32]);

    let (mut a, b) = duplex(DUPLEX_BUFFER);
    a.write_all(&flight).await.unwrap();
    let err = server.handshake(b).await.unwrap_err();
    assert!(matches!(err, VlessError::ProtocolViolation), "{err:?}");

    let mut response = Vec::new();
    a.read_to_end(&mut response).await.unwrap();
    assert!(response.is_empty());
}

#[tokio::test]
async fn unknown_cipher_byte_is_rejected() {
    let (_, chain) = chains().remove(0);
    let server = server(chain, ServerOptions::default());
    let mut flight = vec![0u8; 17 + 32];
    flight[16] = 0x7f;

    let (mut a, b) = duplex(DUPLEX_BUFFER);
    a.write_all(&flight).await.unwrap();
    let err = server.handshake(b).await.unwrap_err();
    assert!(matches!(err, VlessError::ProtocolViolation), "{err:?}");
}

#[tokio::test]
async fn mismatched_obfuscation_fails() {
    let (_, chain) = chains().remove(2);
    let server = server(
        chain,
        ServerOptions::default().with_obfuscation(ObfuscationMode::Full),
    );
    let client = client_for(&server, ClientOptions::default());
    let (a, b) = duplex(DUPLEX_BUFFER);
    let (c, s) = tokio::join!(client.handshake(a), server.handshake(b));
    assert!(s.is_err());
    assert!(c.is_err());
}

#[tokio::test]
async fn tampered_data_record_fails_authentication() {
    let (_, chain) = chains().remove(0);
    let server = ServerInstance::new(
        chain,
        ServerOptions::default().with_padding(PaddingConfig::disabled()),
    )
    .unwrap();
    let client = ClientInstance::new(
        server.chain().public_chain(),
        ClientOptions::default().with_padding(PaddingConfig::disabled()),
    )
    .unwrap();

    // prefix + relay + client hello record, then one byte into the next record's body
    let hello_flight = 17 + 32 + 5 + 16 + 1248;
    let target = hello_flight + 5 + 3;

    let (client_io, relay_client) = duplex(DUPLEX_BUFFER);
    let (relay_server, server_io) = duplex(DUPLEX_BUFFER);
    let (mut from_client, mut to_client) = split(relay_client);
    let (mut from_server, mut to_server) = split(relay_server);

    let upstream = tokio::spawn(async move {
        let mut offset = 0usize;
        let mut buf = [0u8; 4096];
        loop {
            let n = match from_client.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if (offset..offset + n).contains(&target) {
                buf[target - offset] ^= 0x01;
            }
            offset += n;
            if to_server.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    });
    let downstream = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut from_server, &mut to_client).await;
    });

    let (c, s) = tokio::join!(client.handshake(client_io), server.handshake(server_io));
    let mut c = c.unwrap();
    let mut s = s.unwrap();

    c.write_all(b"this record will not survive").await.unwrap();
    c.flush().await.unwrap();
    let mut buf = [0u8; 64];
    let err = s.read(&mut buf).await.unwrap_err();
    assert!(
        matches!(VlessError::from_io(&err), Some(VlessError::Authentication)),
        "{err:?}"
    );

    drop(c);
    drop(s);
    upstream.abort();
    downstream.abort();
}
