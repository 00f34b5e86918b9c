use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::BytesMut;
use log::info;
use tokio::net::UdpSocket;
use tokio::time;

use sstunnel::context::ServiceContext;
use sstunnel::crypto::{bytes_to_key, CipherKind};
use sstunnel::relay::address::Address;
use sstunnel::relay::udprelay::{decrypt_datagram, encrypt_datagram, NatMap, MAX_DATAGRAM_SIZE};
use sstunnel::server::udprelay;
use sstunnel::stats::StatsService;
use sstunnel::users::{LicenseLimit, MemoryCredentials, StaticLicense, UserCredential};

const USER_ID: u32 = 7;
const PASSWORD: &str = "pwd";
const METHOD: CipherKind = CipherKind::Aes256Cfb;

fn test_context(auth: bool, udp_timeout: Duration, license: LicenseLimit) -> Arc<ServiceContext> {
    let (stats, _worker) = StatsService::spawn();
    let credentials = Arc::new(MemoryCredentials::from_map(HashMap::from([(
        USER_ID,
        UserCredential {
            password: PASSWORD.to_owned(),
            bandwidth_mbps: -1,
        },
    )])));
    ServiceContext::new(
        METHOD,
        auth,
        Duration::from_secs(60),
        udp_timeout,
        stats,
        credentials,
        Arc::new(StaticLicense(license)),
        None,
    )
}

fn user_key() -> Box<[u8]> {
    bytes_to_key(PASSWORD.as_bytes(), METHOD.key_len())
}

async fn spawn_relay(context: Arc<ServiceContext>) -> (SocketAddr, Arc<NatMap>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let nat = NatMap::new();
    tokio::spawn(udprelay::run_with_nat(context, socket, nat.clone()));
    (addr, nat)
}

/// Mock destination: expects one datagram of `expect_len` bytes and
/// answers with `reply_len` bytes of 0x5A
async fn spawn_mock_destination(expect_len: usize, reply_len: usize) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, src) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(..) => return,
            };
            assert_eq!(n, expect_len, "mock destination got a mangled datagram");
            let reply = vec![0x5Au8; reply_len];
            let _ = socket.send_to(&reply, src).await;
        }
    });
    addr
}

async fn send_and_receive(
    relay_addr: SocketAddr,
    target: &Address,
    payload: &[u8],
    ota: bool,
) -> (UdpSocket, Vec<u8>) {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(relay_addr).await.unwrap();

    let mut wire = BytesMut::new();
    encrypt_datagram(METHOD, &user_key(), target, payload, ota, Some(USER_ID), &mut wire);
    client.send(&wire).await.unwrap();

    let mut reply = vec![0u8; MAX_DATAGRAM_SIZE];
    let n = time::timeout(Duration::from_secs(5), client.recv(&mut reply))
        .await
        .expect("no reply within timeout")
        .unwrap();
    reply.truncate(n);
    (client, reply)
}

#[tokio::test]
async fn udp_forward_and_reply() {
    let _ = env_logger::try_init();

    let udp_timeout = Duration::from_millis(500);
    let context = test_context(false, udp_timeout, LicenseLimit::unlimited());
    let (relay_addr, nat) = spawn_relay(context.clone()).await;
    let mock_addr = spawn_mock_destination(512, 256).await;

    let target = Address::SocketAddress(mock_addr);
    let payload = vec![0xA5u8; 512];
    let (_client, reply_wire) = send_and_receive(relay_addr, &target, &payload, false).await;

    let datagram = decrypt_datagram(METHOD, &user_key(), &reply_wire, false).await.unwrap();
    assert_eq!(datagram.payload.len(), 256);
    assert!(datagram.payload.iter().all(|&b| b == 0x5A));
    assert_eq!(datagram.addr, Address::SocketAddress(mock_addr));

    // one association for our client source, removed after the idle timeout
    assert_eq!(nat.len(), 1);
    time::sleep(udp_timeout + Duration::from_millis(500)).await;
    assert!(nat.is_empty(), "nat entry survived past its deadline");

    let snapshot = context.stats().snapshot().await;
    let user = &snapshot[&USER_ID];
    assert!(user.bytes_in >= 512);
    assert!(user.bytes_out >= 256);
    info!("udp relayed in={} out={}", user.bytes_in, user.bytes_out);
}

#[tokio::test]
async fn udp_authenticated_roundtrip() {
    let _ = env_logger::try_init();

    let context = test_context(true, Duration::from_millis(500), LicenseLimit::unlimited());
    let (relay_addr, _nat) = spawn_relay(context).await;
    let mock_addr = spawn_mock_destination(16, 32).await;

    let target = Address::SocketAddress(mock_addr);
    let (_client, reply_wire) = send_and_receive(relay_addr, &target, &[0x11u8; 16], true).await;

    // the reply is authenticated too, and verifies
    let datagram = decrypt_datagram(METHOD, &user_key(), &reply_wire, false).await.unwrap();
    assert!(datagram.ota);
    assert_eq!(datagram.payload.len(), 32);
}

#[tokio::test]
async fn runt_and_unauthenticated_datagrams_are_dropped() {
    let _ = env_logger::try_init();

    let context = test_context(true, Duration::from_millis(500), LicenseLimit::unlimited());
    let (relay_addr, nat) = spawn_relay(context).await;
    let mock_addr = spawn_mock_destination(8, 8).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(relay_addr).await.unwrap();

    // shorter than a user id
    client.send(&[0x01, 0x02, 0x03]).await.unwrap();

    // valid user id but datagram shorter than user id + iv
    client.send(&[0, 0, 0, 7, 0xAA, 0xBB]).await.unwrap();

    // well-formed but missing the required auth tag
    let mut wire = BytesMut::new();
    let target = Address::SocketAddress(mock_addr);
    encrypt_datagram(METHOD, &user_key(), &target, &[0u8; 8], false, Some(USER_ID), &mut wire);
    client.send(&wire).await.unwrap();

    let mut buf = [0u8; 64];
    let got_reply = time::timeout(Duration::from_millis(700), client.recv(&mut buf)).await;
    assert!(got_reply.is_err(), "dropped datagrams must not produce replies");
    assert!(nat.is_empty());
}

#[tokio::test]
async fn expired_license_drops_datagrams_silently() {
    let _ = env_logger::try_init();

    let expired = LicenseLimit {
        expire_at: Some(SystemTime::now() - Duration::from_secs(3600)),
        ..LicenseLimit::unlimited()
    };
    let context = test_context(false, Duration::from_millis(500), expired);
    let (relay_addr, nat) = spawn_relay(context).await;
    let mock_addr = spawn_mock_destination(4, 4).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(relay_addr).await.unwrap();

    let mut wire = BytesMut::new();
    let target = Address::SocketAddress(mock_addr);
    encrypt_datagram(METHOD, &user_key(), &target, &[1, 2, 3, 4], false, Some(USER_ID), &mut wire);
    client.send(&wire).await.unwrap();

    let mut buf = [0u8; 64];
    let got_reply = time::timeout(Duration::from_millis(700), client.recv(&mut buf)).await;
    assert!(got_reply.is_err());
    assert!(nat.is_empty());
}
