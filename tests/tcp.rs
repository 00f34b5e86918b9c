use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::info;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

use sstunnel::context::ServiceContext;
use sstunnel::crypto::{Cipher, CipherKind};
use sstunnel::relay::address::Address;
use sstunnel::relay::tcprelay::{make_request_head, CryptoStream, OtaChunkWriter, ProxyClientStream};
use sstunnel::relay::user_id_to_bytes;
use sstunnel::server::tcprelay;
use sstunnel::stats::StatsService;
use sstunnel::users::{LicenseLimit, MemoryCredentials, StaticLicense, UserCredential};

const USER_ID: u32 = 7;
const PASSWORD: &str = "pwd";

fn test_credentials() -> Arc<MemoryCredentials> {
    Arc::new(MemoryCredentials::from_map(HashMap::from([(
        USER_ID,
        UserCredential {
            password: PASSWORD.to_owned(),
            bandwidth_mbps: -1,
        },
    )])))
}

fn test_context(auth: bool, read_timeout: Duration, license: LicenseLimit) -> Arc<ServiceContext> {
    let (stats, _worker) = StatsService::spawn();
    ServiceContext::new(
        CipherKind::Aes256Cfb,
        auth,
        read_timeout,
        Duration::from_secs(60),
        stats,
        test_credentials(),
        Arc::new(StaticLicense(license)),
        None,
    )
}

async fn spawn_relay(context: Arc<ServiceContext>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(tcprelay::run(context, listener));
    addr
}

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, ..)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(..) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
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

/// Destination that counts every byte it ever receives
async fn spawn_counting_server() -> (SocketAddr, Arc<AtomicU64>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(AtomicU64::new(0));

    let counter = received.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, ..)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    counter.fetch_add(n as u64, Ordering::SeqCst);
                }
            });
        }
    });

    (addr, received)
}

#[tokio::test]
async fn tcp_echo_through_tunnel() {
    let _ = env_logger::try_init();

    let context = test_context(false, Duration::from_secs(60), LicenseLimit::unlimited());
    let relay_addr = spawn_relay(context.clone()).await;
    let echo_addr = spawn_echo_server().await;

    let cipher = Cipher::new("aes-256-cfb", PASSWORD).unwrap();
    let target = Address::SocketAddress(echo_addr);
    let stream = ProxyClientStream::connect(&relay_addr.to_string(), cipher, USER_ID, &target, false)
        .await
        .unwrap();
    let (mut reader, mut writer) = stream.into_split();

    const TOTAL: usize = 1024 * 1024;
    let payload = vec![0xA5u8; 64 * 1024];

    let send = tokio::spawn(async move {
        let mut sent = 0;
        while sent < TOTAL {
            writer.write_payload(&payload).await.unwrap();
            sent += payload.len();
        }
        writer
    });

    let mut received = 0usize;
    let mut buf = vec![0u8; 64 * 1024];
    while received < TOTAL {
        let n = reader.read(&mut buf).await.unwrap();
        assert!(n > 0, "tunnel closed early after {received} bytes");
        assert!(buf[..n].iter().all(|&b| b == 0xA5), "corrupted byte in echo");
        received += n;
    }
    assert_eq!(received, TOTAL);
    send.await.unwrap();

    info!("echoed {received} bytes through the tunnel");

    // stats flow through the bounded queue; give the worker a beat
    time::sleep(Duration::from_millis(100)).await;
    let snapshot = context.stats().snapshot().await;
    let user = &snapshot[&USER_ID];
    assert!(user.bytes_in >= TOTAL as u64);
    assert!(user.bytes_out >= TOTAL as u64);
    assert!(user.connections >= 1);
}

#[tokio::test]
async fn ota_tampered_chunk_never_reaches_destination() {
    let _ = env_logger::try_init();

    let context = test_context(true, Duration::from_secs(60), LicenseLimit::unlimited());
    let relay_addr = spawn_relay(context).await;
    let (dest_addr, received) = spawn_counting_server().await;

    // hand-rolled client so the chunk MAC can be corrupted before
    // encryption
    let mut raw = TcpStream::connect(relay_addr).await.unwrap();
    raw.write_all(&user_id_to_bytes(USER_ID)).await.unwrap();

    let cipher = Cipher::new("aes-256-cfb", PASSWORD).unwrap();
    let mut stream = CryptoStream::new(raw, cipher);

    let target = Address::SocketAddress(dest_addr);
    let head = make_request_head(&target, true, stream.key(), &stream.local_iv());
    stream.write_all(&head).await.unwrap();

    let mut frame = Vec::new();
    OtaChunkWriter::new(stream.local_iv())
        .write_chunk(&mut frame, b"should never arrive")
        .await
        .unwrap();
    frame[5] ^= 0x01; // one bit inside the MAC region
    stream.write_all(&frame).await.unwrap();

    // server closes the connection on the mismatch
    let mut buf = [0u8; 1];
    let closed = time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await;
    match closed {
        Ok(Ok(0)) | Ok(Err(..)) => {}
        other => panic!("expected server to close, got {other:?}"),
    }

    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(received.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn ota_clean_chunks_are_forwarded() {
    let _ = env_logger::try_init();

    let context = test_context(true, Duration::from_secs(60), LicenseLimit::unlimited());
    let relay_addr = spawn_relay(context).await;
    let echo_addr = spawn_echo_server().await;

    let cipher = Cipher::new("aes-256-cfb", PASSWORD).unwrap();
    let target = Address::SocketAddress(echo_addr);
    let stream = ProxyClientStream::connect(&relay_addr.to_string(), cipher, USER_ID, &target, true)
        .await
        .unwrap();
    assert!(stream.is_ota());
    let (mut reader, mut writer) = stream.into_split();

    writer.write_payload(b"authenticated round trip").await.unwrap();

    let mut buf = [0u8; 24];
    reader.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"authenticated round trip");
}

#[tokio::test]
async fn unknown_user_is_closed_without_data() {
    let _ = env_logger::try_init();

    let context = test_context(false, Duration::from_secs(60), LicenseLimit::unlimited());
    let relay_addr = spawn_relay(context).await;
    let echo_addr = spawn_echo_server().await;

    let cipher = Cipher::new("aes-256-cfb", PASSWORD).unwrap();
    let target = Address::SocketAddress(echo_addr);

    // the server may close during the handshake write, which is also a
    // valid rejection
    let stream = match ProxyClientStream::connect(&relay_addr.to_string(), cipher, 999, &target, false).await {
        Ok(stream) => stream,
        Err(..) => return,
    };
    let (mut reader, mut writer) = stream.into_split();
    let _ = writer.write_payload(b"hello").await;

    let mut buf = [0u8; 1];
    let result = time::timeout(Duration::from_secs(5), reader.read(&mut buf)).await;
    match result {
        Ok(Ok(0)) | Ok(Err(..)) => {}
        other => panic!("expected close for unknown user, got {other:?}"),
    }
}

#[tokio::test]
async fn expired_license_closes_after_user_id() {
    let _ = env_logger::try_init();

    let expired = LicenseLimit {
        expire_at: Some(SystemTime::now() - Duration::from_secs(3600)),
        ..LicenseLimit::unlimited()
    };
    let context = test_context(false, Duration::from_secs(60), expired);
    let relay_addr = spawn_relay(context).await;

    let mut raw = TcpStream::connect(relay_addr).await.unwrap();
    raw.write_all(&user_id_to_bytes(USER_ID)).await.unwrap();

    let mut buf = [0u8; 1];
    let result = time::timeout(Duration::from_secs(5), raw.read(&mut buf)).await;
    match result {
        Ok(Ok(0)) | Ok(Err(..)) => {}
        other => panic!("expected close under expired license, got {other:?}"),
    }
}

#[tokio::test]
async fn idle_connection_hits_read_timeout() {
    let _ = env_logger::try_init();

    let context = test_context(false, Duration::from_millis(200), LicenseLimit::unlimited());
    let relay_addr = spawn_relay(context).await;

    // user id goes through, then silence: the handshake read must time out
    let mut raw = TcpStream::connect(relay_addr).await.unwrap();
    raw.write_all(&user_id_to_bytes(USER_ID)).await.unwrap();

    let mut buf = [0u8; 1];
    let result = time::timeout(Duration::from_secs(5), raw.read(&mut buf)).await;
    match result {
        Ok(Ok(0)) | Ok(Err(..)) => {}
        other => panic!("expected timeout close, got {other:?}"),
    }
}
