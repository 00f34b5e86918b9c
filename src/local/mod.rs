//! Client-side engine
//!
//! Listens locally and forwards everything to a fixed remote destination
//! through one of the configured relay servers: a TCP port forwarder, a
//! one-shot UDP forwarder, and optionally a DNS forwarder that tunnels
//! queries to a configured resolver.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, error, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time;

use crate::config::{Config, ConfigError};
use crate::crypto::Cipher;
use crate::relay::address::Address;
use crate::relay::tcprelay::BUFFER_SIZE;
use crate::relay::udprelay::{decrypt_datagram, encrypt_datagram, MAX_DATAGRAM_SIZE};

pub use self::dispatcher::{Dispatcher, ServerCipher};

pub mod dispatcher;

/// Build the upstream server list from configuration. `server_password`
/// entries win; otherwise the single-server fields are used.
pub fn build_dispatcher(config: &Config) -> Result<Dispatcher, ConfigError> {
    let mut servers = Vec::new();

    match config.server_password {
        Some(ref entries) if !entries.is_empty() => {
            for entry in entries {
                // validated as 2..=3 strings at load time
                let addr = entry[0].clone();
                let password = &entry[1];
                let method = match entry.get(2) {
                    Some(m) if !m.is_empty() => m.parse()?,
                    _ => config.method()?,
                };
                servers.push(ServerCipher::new(addr, Cipher::from_method(method, password)));
            }
        }
        _ => {
            let method = config.method()?;
            let password = match config.password {
                Some(ref p) if !p.is_empty() => p,
                _ => return Err(ConfigError::MissingClientCredentials),
            };
            let port = match config.server_port {
                Some(port) if port != 0 => port,
                _ => return Err(ConfigError::MissingClientCredentials),
            };

            let hosts = config.server_list();
            if hosts.is_empty() {
                return Err(ConfigError::MissingClientCredentials);
            }
            for host in hosts {
                servers.push(ServerCipher::new(
                    join_host_port(host, port),
                    Cipher::from_method(method, password),
                ));
            }
        }
    }

    Ok(Dispatcher::new(servers))
}

/// Attach the default port unless the host already carries one. Bare
/// IPv6 literals get bracketed.
fn join_host_port(host: String, port: u16) -> String {
    if host.starts_with('[') {
        // bracketed IPv6, port included
        host
    } else if host.matches(':').count() > 1 {
        format!("[{host}]:{port}")
    } else if host.contains(':') {
        host
    } else {
        format!("{host}:{port}")
    }
}

/// Forward every accepted connection to `target` through the tunnel
pub async fn run_tcp_forward(
    dispatcher: Arc<Dispatcher>,
    listener: TcpListener,
    target: Address,
    user_id: u32,
    ota: bool,
) -> io::Result<()> {
    info!(
        "tcp forwarder on {} -> {target}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    loop {
        let (inbound, peer_addr) = match listener.accept().await {
            Ok(s) => s,
            Err(err) => {
                error!("accept failed: {err}");
                time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let dispatcher = dispatcher.clone();
        let target = target.clone();
        tokio::spawn(async move {
            if let Err(err) = forward_connection(dispatcher, inbound, target, user_id, ota).await {
                debug!("forwarded connection {peer_addr} closed: {err}");
            }
        });
    }
}

async fn forward_connection(
    dispatcher: Arc<Dispatcher>,
    mut inbound: TcpStream,
    target: Address,
    user_id: u32,
    ota: bool,
) -> io::Result<()> {
    let proxy = dispatcher.connect(&target, user_id, ota).await?;
    let (mut proxy_read, mut proxy_write) = proxy.into_split();
    let (mut inbound_read, mut inbound_write) = inbound.split();

    let uplink = async {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = inbound_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            proxy_write.write_payload(&buf[..n]).await?;
        }
        proxy_write.shutdown().await
    };

    let downlink = async {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = proxy_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            inbound_write.write_all(&buf[..n]).await?;
        }
        inbound_write.shutdown().await
    };

    tokio::pin!(uplink);
    tokio::pin!(downlink);
    let _ = futures::future::select(uplink, downlink).await;
    Ok(())
}

/// Forward datagrams to `target` through the tunnel, relaying one reply
/// back to each sender. This is also the DNS forwarding mode.
pub async fn run_udp_forward(
    dispatcher: Arc<Dispatcher>,
    socket: UdpSocket,
    target: Address,
    user_id: u32,
    ota: bool,
    udp_timeout: Duration,
) -> io::Result<()> {
    info!(
        "udp forwarder on {} -> {target}",
        socket.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    let socket = Arc::new(socket);
    loop {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                error!("udp recv failed: {err}");
                continue;
            }
        };
        buf.truncate(n);

        let dispatcher = dispatcher.clone();
        let socket = socket.clone();
        let target = target.clone();
        tokio::spawn(async move {
            if let Err(err) = forward_packet(dispatcher, socket, src, buf, target, user_id, ota, udp_timeout).await {
                debug!("udp forward for {src} failed: {err}");
            }
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward_packet(
    dispatcher: Arc<Dispatcher>,
    listener: Arc<UdpSocket>,
    src: SocketAddr,
    data: Vec<u8>,
    target: Address,
    user_id: u32,
    ota: bool,
    udp_timeout: Duration,
) -> io::Result<()> {
    let (remote, cipher) = dispatcher.connect_udp().await?;

    let mut wire = BytesMut::new();
    encrypt_datagram(cipher.method(), cipher.key(), &target, &data, ota, Some(user_id), &mut wire);
    remote.send(&wire).await?;

    let mut reply = vec![0u8; MAX_DATAGRAM_SIZE];
    let n = time::timeout(udp_timeout, remote.recv(&mut reply))
        .await
        .map_err(|_| io::Error::new(ErrorKind::TimedOut, "no reply from relay server"))??;

    let datagram = decrypt_datagram(cipher.method(), cipher.key(), &reply[..n], false).await?;
    listener.send_to(&datagram.payload, src).await?;
    Ok(())
}
