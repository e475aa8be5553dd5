//! End-to-end tests: real client and server edges over loopback sockets,
//! with a local echo server standing in for the downstream mining pool.

use miner_tunnel::client::ClientInstance;
use miner_tunnel::codec::{Envelope, EnvelopeType, FrameCodec, InitPayload, LoginPayload};
use miner_tunnel::config::{ClientConfig, ServerConfig};
use miner_tunnel::pool::{AnnounceFn, PoolConfig, Tunnel, TunnelEvent, TunnelPool};
use miner_tunnel::server::ServerInstance;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const SECRET: &str = "integration-test-key";

/// Downstream pool stand-in: echoes every byte back
async fn spawn_echo_pool() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn server_config(pool_addr: &str, obfuscate: bool) -> ServerConfig {
    ServerConfig {
        listen: "127.0.0.1:0".to_string(),
        secret_key: SECRET.to_string(),
        pool_address: pool_addr.to_string(),
        obfuscate,
        ping_interval_secs: 1,
        offline_grace_secs: 1,
        init_timeout_secs: 10,
    }
}

fn client_config(remote: &str, obfuscate: bool, max_conn: usize) -> ClientConfig {
    ClientConfig {
        listen: "127.0.0.1:0".to_string(),
        remote: remote.to_string(),
        secret_key: SECRET.to_string(),
        obfuscate,
        max_conn,
        pool_address: String::new(),
        client_id: String::new(),
    }
}

async fn start_pair(obfuscate: bool, max_conn: usize) -> (Arc<ServerInstance>, Arc<ClientInstance>) {
    let pool_addr = spawn_echo_pool().await;
    let server = ServerInstance::start(server_config(&pool_addr, obfuscate))
        .await
        .unwrap();
    let client = ClientInstance::start(client_config(
        &server.local_addr().to_string(),
        obfuscate,
        max_conn,
    ))
    .await
    .unwrap();
    (server, client)
}

/// Write through the whole chain and read the echo back
async fn assert_echo(client: &ClientInstance, payload: &[u8]) {
    let mut miner = TcpStream::connect(client.local_addr()).await.unwrap();
    miner.write_all(payload).await.unwrap();

    let mut got = vec![0u8; payload.len()];
    timeout(Duration::from_secs(10), miner.read_exact(&mut got))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(got, payload);
}

#[tokio::test]
async fn test_end_to_end_relay_plain() {
    let (server, client) = start_pair(false, 1).await;
    assert_echo(&client, b"1").await;

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_end_to_end_relay_obfuscated() {
    let (server, client) = start_pair(true, 1).await;
    assert_echo(&client, b"mining.subscribe").await;

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_miners_share_one_tunnel() {
    let (server, client) = start_pair(false, 1).await;

    let mut handles = Vec::new();
    for i in 0..4u8 {
        let addr = client.local_addr();
        handles.push(tokio::spawn(async move {
            let mut miner = TcpStream::connect(addr).await.unwrap();
            let payload = vec![i; 32];
            miner.write_all(&payload).await.unwrap();
            let mut got = vec![0u8; 32];
            timeout(Duration::from_secs(10), miner.read_exact(&mut got))
                .await
                .expect("echo timed out")
                .unwrap();
            assert_eq!(got, payload);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_pool_fills_to_max_conn() {
    let (server, client) = start_pair(false, 3).await;
    assert_eq!(client.tunnel_count().await, 3);

    // the pool still relays traffic across its tunnels
    assert_echo(&client, b"hello").await;

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_backend_closes_miner_socket() {
    let pool_addr = spawn_echo_pool().await;
    let server = ServerInstance::start(server_config(&pool_addr, false))
        .await
        .unwrap();

    // port 1 refuses immediately; the LOGIN must come back as ERROR
    let mut cfg = client_config(&server.local_addr().to_string(), false, 1);
    cfg.pool_address = "127.0.0.1:1".to_string();
    let client = ClientInstance::start(cfg).await.unwrap();

    let mut miner = TcpStream::connect(client.local_addr()).await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(10), miner.read(&mut buf))
        .await
        .expect("miner socket was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0, "expected EOF on the miner socket");

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_reconciliation_purges_disavowed_session() {
    // a hand-rolled client edge that logs a miner in and then disavows it
    // in its PONG, exercising the server's ping-driven garbage collection
    let pool_addr = spawn_echo_pool().await;
    let server = ServerInstance::start(server_config(&pool_addr, false))
        .await
        .unwrap();

    let codec = FrameCodec::new(SECRET, false).unwrap();
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let (events_tx, mut events_rx) = mpsc::channel::<TunnelEvent>(64);
    let tunnel = Tunnel::start(1, stream, codec, events_tx);

    let init = Envelope::with_data(
        EnvelopeType::Init,
        "ghost-client",
        "",
        InitPayload {
            local_ip: "127.0.0.1".to_string(),
            miner_ids: vec!["m-ghost".to_string()],
        }
        .encode()
        .unwrap(),
    );
    tunnel.write_envelope(&init).await.unwrap();

    let login = Envelope::with_data(
        EnvelopeType::Login,
        "ghost-client",
        "m-ghost",
        LoginPayload {
            pool_address: String::new(),
            miner_ip: "127.0.0.1".to_string(),
        }
        .encode()
        .unwrap(),
    );
    tunnel.write_envelope(&login).await.unwrap();

    // wait for the login ack, then answer every ping by disavowing m-ghost
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut logged_in = false;
    let mut purged = false;
    while tokio::time::Instant::now() < deadline {
        let event = match timeout(Duration::from_secs(5), events_rx.recv()).await {
            Ok(Some(event)) => event,
            _ => break,
        };
        match event {
            TunnelEvent::Envelope { envelope, .. } => match envelope.kind {
                EnvelopeType::Login => {
                    logged_in = true;
                    assert_eq!(server.session_count(), 1);
                }
                EnvelopeType::Ping => {
                    let pong = Envelope::with_data(
                        EnvelopeType::Pong,
                        "ghost-client",
                        "",
                        b"m-ghost".to_vec(),
                    );
                    tunnel.write_envelope(&pong).await.unwrap();
                    // the server purges on receipt; poll briefly
                    for _ in 0..50 {
                        if server.session_count() == 0 {
                            purged = true;
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    if purged {
                        break;
                    }
                }
                _ => {}
            },
            TunnelEvent::Closed { .. } => break,
        }
    }

    assert!(logged_in, "login was never acknowledged");
    assert!(purged, "disavowed session was not purged");

    tunnel.close();
    server.shutdown().await;
}

#[tokio::test]
async fn test_pool_recovers_after_tunnel_loss() {
    let pool_addr = spawn_echo_pool().await;
    let server = ServerInstance::start(server_config(&pool_addr, false))
        .await
        .unwrap();

    let codec = FrameCodec::new(SECRET, false).unwrap();
    let (events_tx, mut events_rx) = mpsc::channel::<TunnelEvent>(64);
    let announce: AnnounceFn = Arc::new(Vec::new);
    let pool = TunnelPool::new(
        PoolConfig {
            remote_addr: server.local_addr().to_string(),
            max_conn: 3,
            client_id: "pool-test".to_string(),
        },
        codec,
        events_tx,
        announce,
    );
    pool.refill().await;
    assert_eq!(pool.len().await, 3);

    // mirror the client engine: drop a tunnel from the pool when it closes
    let janitor = Arc::clone(&pool);
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if let TunnelEvent::Closed { tunnel_id } = event {
                janitor.remove(tunnel_id).await;
            }
        }
    });
    let refill = pool.spawn_refill_loop();

    pool.get().await.unwrap().close();
    let mut shrunk = false;
    for _ in 0..50 {
        if pool.len().await < 3 {
            shrunk = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(shrunk, "closed tunnel was never dropped from the pool");

    // back to full strength within one refill tick
    let mut recovered = false;
    for _ in 0..70 {
        if pool.len().await == 3 {
            recovered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(recovered, "pool did not refill after losing a tunnel");
    assert!(!pool.get().await.unwrap().is_closed());

    refill.abort();
    pool.close_all().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_pong_only_purges_own_client_sessions() {
    // one client logs a miner in; a different client disavows that miner id
    // in its PONG. Only the owner's disavowal may close the session.
    let pool_addr = spawn_echo_pool().await;
    let server = ServerInstance::start(server_config(&pool_addr, false))
        .await
        .unwrap();

    let codec = FrameCodec::new(SECRET, false).unwrap();
    let alpha_stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let (alpha_tx, mut alpha_rx) = mpsc::channel::<TunnelEvent>(64);
    let alpha = Tunnel::start(1, alpha_stream, codec.clone(), alpha_tx);

    let init = Envelope::with_data(
        EnvelopeType::Init,
        "alpha-client",
        "",
        InitPayload {
            local_ip: "127.0.0.1".to_string(),
            miner_ids: vec!["m-alpha".to_string()],
        }
        .encode()
        .unwrap(),
    );
    alpha.write_envelope(&init).await.unwrap();

    let login = Envelope::with_data(
        EnvelopeType::Login,
        "alpha-client",
        "m-alpha",
        LoginPayload {
            pool_address: String::new(),
            miner_ip: "127.0.0.1".to_string(),
        }
        .encode()
        .unwrap(),
    );
    alpha.write_envelope(&login).await.unwrap();

    let mut logged_in = false;
    while let Ok(Some(event)) = timeout(Duration::from_secs(10), alpha_rx.recv()).await {
        if let TunnelEvent::Envelope { envelope, .. } = event {
            if envelope.kind == EnvelopeType::Login {
                logged_in = true;
                break;
            }
        }
    }
    assert!(logged_in, "login was never acknowledged");
    assert_eq!(server.session_count(), 1);

    // a second client names alpha's miner in its own PONG
    let beta_stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let (beta_tx, _beta_rx) = mpsc::channel::<TunnelEvent>(64);
    let beta = Tunnel::start(2, beta_stream, codec, beta_tx);
    let beta_init = Envelope::with_data(
        EnvelopeType::Init,
        "beta-client",
        "",
        InitPayload {
            local_ip: "127.0.0.1".to_string(),
            miner_ids: Vec::new(),
        }
        .encode()
        .unwrap(),
    );
    beta.write_envelope(&beta_init).await.unwrap();
    let foreign_pong =
        Envelope::with_data(EnvelopeType::Pong, "beta-client", "", b"m-alpha".to_vec());
    beta.write_envelope(&foreign_pong).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        server.session_count(),
        1,
        "a foreign pong must not purge another client's session"
    );

    // the owner's own disavowal still works
    let own_pong =
        Envelope::with_data(EnvelopeType::Pong, "alpha-client", "", b"m-alpha".to_vec());
    alpha.write_envelope(&own_pong).await.unwrap();
    let mut purged = false;
    for _ in 0..50 {
        if server.session_count() == 0 {
            purged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(purged, "owner's disavowal was ignored");

    alpha.close();
    beta.close();
    server.shutdown().await;
}

#[tokio::test]
async fn test_silent_tunnel_is_dropped() {
    let pool_addr = spawn_echo_pool().await;
    let mut cfg = server_config(&pool_addr, false);
    cfg.init_timeout_secs = 1;
    let server = ServerInstance::start(cfg).await.unwrap();

    // connect and say nothing, like a port scan
    let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .expect("silent connection was never dropped")
        .unwrap_or(0);
    assert_eq!(n, 0, "expected EOF on the silent connection");

    server.shutdown().await;
}
