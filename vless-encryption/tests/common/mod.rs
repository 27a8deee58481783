#![allow(dead_code)]

use std::time::Duration;

use crypto::deterministic::expand_array;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use vless_encryption::{
    ClientInstance, ClientOptions, NfsPrivateKey, PaddingConfig, PrivateKeyChain, SecureConn,
    ServerInstance, ServerOptions,
};

pub const DUPLEX_BUFFER: usize = 64 * 1024;

/// Route handshake logs to the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn x25519_key(label: &str) -> NfsPrivateKey {
    NfsPrivateKey::from_bytes(&expand_array::<32>(b"vless-test-key", label.as_bytes()))
        .expect("x25519 key")
}

pub fn mlkem_key(label: &str) -> NfsPrivateKey {
    NfsPrivateKey::from_bytes(&expand_array::<64>(b"vless-test-key", label.as_bytes()))
        .expect("ml-kem seed")
}

/// Chains of every shape worth covering: single of each kind, mixed, three deep.
pub fn chains() -> Vec<(&'static str, PrivateKeyChain)> {
    vec![
        ("x25519", PrivateKeyChain::new(vec![x25519_key("solo-x")]).unwrap()),
        ("mlkem", PrivateKeyChain::new(vec![mlkem_key("solo-k")]).unwrap()),
        (
            "mlkem+x25519",
            PrivateKeyChain::new(vec![mlkem_key("mix-k"), x25519_key("mix-x")]).unwrap(),
        ),
        (
            "x25519+x25519+mlkem",
            PrivateKeyChain::new(vec![
                x25519_key("deep-1"),
                x25519_key("deep-2"),
                mlkem_key("deep-3"),
            ])
            .unwrap(),
        ),
    ]
}

/// Default shape with short gaps so tests stay quick.
pub fn test_padding() -> PaddingConfig {
    PaddingConfig::default().with_gap(Duration::ZERO, Duration::from_millis(1))
}

pub fn server(chain: PrivateKeyChain, options: ServerOptions) -> ServerInstance {
    ServerInstance::new(chain, options.with_padding(test_padding())).expect("server")
}

pub fn client_for(server: &ServerInstance, options: ClientOptions) -> ClientInstance {
    ClientInstance::new(
        server.chain().public_chain(),
        options.with_padding(test_padding()),
    )
    .expect("client")
}

pub async fn connect(
    client: &ClientInstance,
    server: &ServerInstance,
) -> (SecureConn<DuplexStream>, SecureConn<DuplexStream>) {
    let (a, b) = duplex(DUPLEX_BUFFER);
    let (c, s) = tokio::join!(client.handshake(a), server.handshake(b));
    (c.expect("client handshake"), s.expect("server handshake"))
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Send `len` bytes each way and check they arrive intact.
pub async fn exchange(
    client: &mut SecureConn<DuplexStream>,
    server: &mut SecureConn<DuplexStream>,
    len: usize,
) {
    let data = pattern(len);
    let expected = data.clone();
    let writer = async {
        client.write_all(&data).await.unwrap();
        client.flush().await.unwrap();
    };
    let reader = async {
        let mut got = vec![0u8; len];
        server.read_exact(&mut got).await.unwrap();
        got
    };
    let ((), got) = tokio::join!(writer, reader);
    assert_eq!(got, expected, "client -> server, {} bytes", len);

    let writer = async {
        server.write_all(&data).await.unwrap();
        server.flush().await.unwrap();
    };
    let reader = async {
        let mut got = vec![0u8; len];
        client.read_exact(&mut got).await.unwrap();
        got
    };
    let ((), got) = tokio::join!(writer, reader);
    assert_eq!(got, expected, "server -> client, {} bytes", len);
}

/// Run a 0-RTT client handshake against nothing and return the bytes it sent.
pub async fn capture_resume_flight(client: &ClientInstance) -> Vec<u8> {
    let (a, mut b) = duplex(DUPLEX_BUFFER);
    let conn = client.handshake(a).await.expect("0-RTT handshake");
    assert!(conn.is_resumed());
    drop(conn);
    let mut flight = Vec::new();
    b.read_to_end(&mut flight).await.unwrap();
    flight
}

/// Feed `flight` to the server and return its result plus everything it wrote back.
pub async fn replay_to_server(
    server: &ServerInstance,
    flight: &[u8],
) -> (vless_encryption::Result<SecureConn<DuplexStream>>, Vec<u8>) {
    let (mut a, b) = duplex(DUPLEX_BUFFER);
    a.write_all(flight).await.unwrap();
    let result = server.handshake(b).await;
    let mut response = Vec::new();
    if result.is_err() {
        // the server side is gone, so this reads to EOF
        a.read_to_end(&mut response).await.unwrap();
    }
    (result, response)
}
