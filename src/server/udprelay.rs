//! UDP side of the relay server

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use log::{debug, error, info, trace, warn};
use tokio::net::UdpSocket;

use crate::buffer::PooledBuf;
use crate::context::ServiceContext;
use crate::crypto::CipherKind;
use crate::rate::RATE_LIMIT_WAIT_MAX;
use crate::relay::address::Address;
use crate::relay::udprelay::{decrypt_datagram, encrypt_datagram, NatEntry, NatMap, MAX_DATAGRAM_SIZE};
use crate::relay::{user_id_from_bytes, USER_ID_LEN};

/// Receive loop. Each datagram is handled on its own task; a bad packet
/// never affects the loop or other associations.
pub async fn run(context: Arc<ServiceContext>, socket: UdpSocket) -> io::Result<()> {
    run_with_nat(context, socket, NatMap::new()).await
}

/// Same loop with a caller-supplied NAT table, so its lifecycle can be
/// observed from outside
pub async fn run_with_nat(context: Arc<ServiceContext>, socket: UdpSocket, nat: Arc<NatMap>) -> io::Result<()> {
    info!(
        "udp relay receiving on {}",
        socket.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    let socket = Arc::new(socket);

    loop {
        let mut buf = context.buffer_pool().get();
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                error!("udp recv failed: {err}");
                continue;
            }
        };

        let context = context.clone();
        let socket = socket.clone();
        let nat = nat.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_datagram(context, socket, nat, src, buf, n).await {
                debug!("udp packet from {src} dropped: {err}");
            }
        });
    }
}

async fn handle_datagram(
    context: Arc<ServiceContext>,
    listener: Arc<UdpSocket>,
    nat: Arc<NatMap>,
    src: SocketAddr,
    buf: PooledBuf,
    n: usize,
) -> io::Result<()> {
    if context.license().limit().is_expired() {
        // dropped without a reply on purpose
        return Ok(());
    }

    if n < USER_ID_LEN {
        return Err(io::Error::new(ErrorKind::InvalidData, "datagram too short for user id"));
    }
    let user_id = user_id_from_bytes([buf[0], buf[1], buf[2], buf[3]]);

    let credential = match context.lookup_user(user_id) {
        Some(c) => c,
        None => {
            warn!("rejected datagram from {src}");
            return Ok(());
        }
    };
    let bandwidth = context.license().limit().cap_bandwidth(credential.bandwidth_mbps);

    context.stats().inc_bytes_in(user_id, n as u64).await;

    let cipher = context.cipher_for_user(user_id, &credential.password);
    let datagram = decrypt_datagram(cipher.method(), cipher.key(), &buf[USER_ID_LEN..n], context.auth()).await?;

    if context.is_host_blocked(&datagram.addr.host()) {
        warn!("udp destination {} blocked for {src}", datagram.addr);
        return Ok(());
    }

    trace!(
        "udp user {user_id} {src} -> {} with {} bytes ota={}",
        datagram.addr,
        datagram.payload.len(),
        datagram.ota
    );

    let source_key = src.to_string();
    let udp_timeout = context.udp_timeout();
    let (entry, created) = nat.get_or_create(&source_key, udp_timeout).await?;

    if created {
        let pump = ReplyPump {
            context: context.clone(),
            nat: nat.clone(),
            entry: entry.clone(),
            listener,
            client: src,
            source_key: source_key.clone(),
            method: cipher.method(),
            key: Bytes::copy_from_slice(cipher.key()),
            ota: datagram.ota,
            user_id,
            bandwidth,
        };
        tokio::spawn(pump.run());
    }
    entry.refresh(udp_timeout);

    let dest = resolve(&datagram.addr).await?;
    if let Err(err) = entry.send_to(&datagram.payload, dest).await {
        nat.remove(&source_key);
        return Err(err);
    }

    if let Some(bucket) = context.read_bucket_for_user(user_id, bandwidth) {
        bucket.wait_max(n as i64, RATE_LIMIT_WAIT_MAX).await;
    }
    Ok(())
}

async fn resolve(addr: &Address) -> io::Result<SocketAddr> {
    match *addr {
        Address::SocketAddress(sa) => Ok(sa),
        Address::DomainNameAddress(ref name, port) => {
            let mut addrs = tokio::net::lookup_host((name.as_str(), port)).await?;
            addrs
                .next()
                .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("no address for {name}")))
        }
    }
}

/// Reads replies from one association's upstream socket, re-frames each
/// with a fresh IV and returns it to the client source. Owns the NAT
/// entry: removes it on exit, whether by idle expiry or error.
struct ReplyPump {
    context: Arc<ServiceContext>,
    nat: Arc<NatMap>,
    entry: Arc<NatEntry>,
    listener: Arc<UdpSocket>,
    client: SocketAddr,
    source_key: String,
    method: CipherKind,
    key: Bytes,
    ota: bool,
    user_id: u32,
    bandwidth: i64,
}

impl ReplyPump {
    async fn run(self) {
        let mut buf = self.context.buffer_pool().get();

        loop {
            let (n, remote_addr) = match self.entry.recv_until_deadline(&mut buf).await {
                Ok(Some(v)) => v,
                Ok(None) => {
                    trace!("udp association {} expired", self.source_key);
                    break;
                }
                Err(err) => {
                    debug!("udp association {} read failed: {err}", self.source_key);
                    break;
                }
            };

            self.entry.refresh(self.context.udp_timeout());

            let mut out = BytesMut::new();
            encrypt_datagram(
                self.method,
                &self.key,
                &Address::from(remote_addr),
                &buf[..n],
                self.ota,
                None,
                &mut out,
            );
            if out.len() > MAX_DATAGRAM_SIZE {
                warn!("oversized udp reply for {} dropped", self.source_key);
                continue;
            }

            match self.listener.send_to(&out, self.client).await {
                Ok(sent) => {
                    self.context.stats().inc_bytes_out(self.user_id, sent as u64).await;
                    if let Some(bucket) = self.context.write_bucket_for_user(self.user_id, self.bandwidth) {
                        bucket.wait_max(sent as i64, RATE_LIMIT_WAIT_MAX).await;
                    }
                }
                Err(err) => {
                    warn!("udp reply to {} failed: {err}", self.client);
                    break;
                }
            }
        }

        self.nat.remove(&self.source_key);
    }
}
