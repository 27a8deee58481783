use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task;
use vless_encryption::{ClientConfig, ClientInstance, ServerConfig, ServerInstance};
use vless_tunnel::{generate_config, run_client, run_server, KeyKind};

async fn spawn_echo() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");
    task::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            task::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr.to_string()
}

/// Start a tunnel server in front of an echo service and a tunnel client in
/// front of that; return the client's listen address.
async fn spawn_tunnel(chain: &[KeyKind], mode: &str) -> String {
    let config = generate_config(chain, mode, "600s", true).expect("config");
    let server_config: ServerConfig = config.decryption.parse().expect("server config");
    let client_config: ClientConfig = config.encryption.parse().expect("client config");
    let server = ServerInstance::new(server_config.chain, server_config.options).expect("server");
    let server = Arc::new(server);
    let client = ClientInstance::new(client_config.chain, client_config.options).expect("client");
    let client = Arc::new(client);

    let echo = spawn_echo().await;
    let server_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind server");
    let server_addr = server_listener.local_addr().expect("server addr").to_string();
    task::spawn(run_server(server_listener, echo, server, Duration::from_secs(5)));

    let client_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind client");
    let client_addr = client_listener.local_addr().expect("client addr").to_string();
    task::spawn(run_client(client_listener, server_addr, client, Duration::from_secs(5)));
    client_addr
}

async fn echo_through(addr: &str, payload: &[u8]) -> Vec<u8> {
    let mut socket = TcpStream::connect(addr).await.expect("connect tunnel");
    let (mut rd, mut wr) = socket.split();
    let write = async {
        wr.write_all(payload).await.expect("write");
        wr.shutdown().await.expect("shutdown");
    };
    let read = async {
        let mut got = Vec::new();
        rd.read_to_end(&mut got).await.expect("read");
        got
    };
    let ((), got) = tokio::join!(write, read);
    got
}

#[tokio::test]
async fn traffic_survives_the_tunnel() {
    let addr = spawn_tunnel(&[KeyKind::Mlkem768, KeyKind::X25519], "random").await;
    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
    assert_eq!(echo_through(&addr, &payload).await, payload);
    // the second connection rides a ticket from the first
    assert_eq!(echo_through(&addr, b"hello again").await, b"hello again");
}

#[tokio::test]
async fn parallel_connections_are_independent() {
    let addr = spawn_tunnel(&[KeyKind::X25519], "native").await;
    let mut handles = Vec::new();
    for i in 0..8u8 {
        let addr = addr.clone();
        handles.push(task::spawn(async move {
            let payload = vec![i; 4096 + i as usize];
            let got = echo_through(&addr, &payload).await;
            assert_eq!(got, payload);
        }));
    }
    for handle in handles {
        handle.await.expect("connection task");
    }
}

#[tokio::test]
async fn silent_server_drops_garbage() {
    let config = generate_config(&[KeyKind::X25519], "xorpub", "600s", true).expect("config");
    let server_config: ServerConfig = config.decryption.parse().expect("server config");
    let server = ServerInstance::new(server_config.chain, server_config.options).expect("server");
    let server = Arc::new(server);
    let echo = spawn_echo().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind server");
    let addr = listener.local_addr().expect("server addr");
    task::spawn(run_server(listener, echo, server, Duration::from_secs(5)));

    let mut socket = TcpStream::connect(addr).await.expect("connect");
    socket.write_all(&[0x5a; 512]).await.expect("write garbage");
    let mut response = Vec::new();
    let read =
        tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut response)).await;
    // either a clean close or a reset, never a reply
    if let Ok(Ok(_)) = read {
        assert!(response.is_empty());
    }
}
