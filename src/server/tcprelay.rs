//! TCP side of the relay server

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{self, Either};
use log::{debug, error, info, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

use crate::context::ServiceContext;
use crate::rate::{Bucket, RATE_LIMIT_WAIT_MAX};
use crate::relay::address::Address;
use crate::relay::tcprelay::{read_request, CryptoStream, OtaChunkReader, BUFFER_SIZE};
use crate::relay::{user_id_from_bytes, USER_ID_LEN};
use crate::stats::StatsService;

/// EMFILE is the process running out of descriptors, ENFILE the system
#[cfg(unix)]
fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

#[cfg(not(unix))]
fn is_fd_exhaustion(_err: &io::Error) -> bool {
    false
}

fn timeout_error() -> io::Error {
    io::Error::new(ErrorKind::TimedOut, "read timed out")
}

/// Accept loop. Accept errors never end the loop; descriptor exhaustion
/// is logged specially and retried after a pause.
pub async fn run(context: Arc<ServiceContext>, listener: TcpListener) -> io::Result<()> {
    info!(
        "tcp relay accepting on {}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(s) => s,
            Err(err) => {
                if is_fd_exhaustion(&err) {
                    error!("accept failed, out of file descriptors: {err}");
                } else {
                    error!("accept failed: {err}");
                }
                time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let context = context.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_client(context, stream, peer_addr).await {
                debug!("tcp client {peer_addr} closed: {err}");
            }
        });
    }
}

async fn serve_client(context: Arc<ServiceContext>, mut stream: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
    let read_timeout = context.read_timeout();

    let mut id_buf = [0u8; USER_ID_LEN];
    time::timeout(read_timeout, stream.read_exact(&mut id_buf))
        .await
        .map_err(|_| timeout_error())??;
    let user_id = user_id_from_bytes(id_buf);

    if context.license().limit().is_expired() {
        debug!("license expired, closing {peer_addr}");
        return Ok(());
    }

    let credential = match context.lookup_user(user_id) {
        Some(c) => c,
        None => {
            warn!("rejected connection from {peer_addr}");
            return Ok(());
        }
    };
    let bandwidth = context.license().limit().cap_bandwidth(credential.bandwidth_mbps);

    let stats = context.stats().clone();
    stats.inc_bytes_in(user_id, USER_ID_LEN as u64).await;
    stats.inc_connections(user_id).await;

    let cipher = context.cipher_for_user(user_id, &credential.password);
    let mut stream = CryptoStream::new(stream, cipher);

    let request = match time::timeout(read_timeout, read_request(&mut stream, context.auth())).await {
        Err(_) => return Err(timeout_error()),
        Ok(result) => result.map_err(io::Error::from)?,
    };

    if context.is_host_blocked(&request.addr.host()) {
        warn!("destination {} blocked for {peer_addr}", request.addr);
        return Ok(());
    }

    trace!("user {user_id} {peer_addr} -> {} ota={}", request.addr, request.ota);
    let remote = match connect_destination(&request.addr).await {
        Ok(s) => s,
        Err(err) => {
            if is_fd_exhaustion(&err) {
                error!("dial failed, out of file descriptors: {err}");
            } else {
                error!("failed to connect {}: {err}", request.addr);
            }
            return Ok(());
        }
    };

    let read_bucket = context.read_bucket_for_user(user_id, bandwidth);
    let write_bucket = context.write_bucket_for_user(user_id, bandwidth);
    let peer_iv = stream.peer_iv().unwrap_or_default();

    let (mut client_read, mut client_write) = tokio::io::split(stream);
    let (mut remote_read, mut remote_write) = remote.into_split();

    let uplink = copy_uplink(
        &mut client_read,
        &mut remote_write,
        request.ota,
        peer_iv,
        read_timeout,
        read_bucket,
        &stats,
        user_id,
    );
    let downlink = copy_downlink(
        &mut remote_read,
        &mut client_write,
        read_timeout,
        write_bucket,
        &stats,
        user_id,
    );
    tokio::pin!(uplink);
    tokio::pin!(downlink);

    // first finisher wins; dropping both halves closes both sockets
    match future::select(uplink, downlink).await {
        Either::Left((result, _)) => {
            trace!("tunnel {peer_addr} -> {} ended: {result:?}", request.addr);
        }
        Either::Right((result, _)) => {
            trace!("tunnel {peer_addr} <- {} ended: {result:?}", request.addr);
        }
    }

    Ok(())
}

async fn connect_destination(addr: &Address) -> io::Result<TcpStream> {
    match *addr {
        Address::SocketAddress(sa) => TcpStream::connect(sa).await,
        Address::DomainNameAddress(ref name, port) => TcpStream::connect((name.as_str(), port)).await,
    }
}

/// Client-to-destination copy. Under one-time auth the stream arrives as
/// authenticated chunks which are verified before any byte moves on; a
/// bad tag ends the connection with nothing forwarded.
#[allow(clippy::too_many_arguments)]
async fn copy_uplink<R, W>(
    reader: &mut R,
    writer: &mut W,
    ota: bool,
    peer_iv: Bytes,
    read_timeout: Duration,
    bucket: Option<Arc<Bucket>>,
    stats: &StatsService,
    user_id: u32,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;

    if ota {
        let mut chunks = OtaChunkReader::new(peer_iv);
        let mut buf = Vec::new();
        loop {
            let n = match time::timeout(read_timeout, chunks.read_chunk(reader, &mut buf)).await {
                Err(_) => return Err(timeout_error()),
                Ok(result) => match result.map_err(io::Error::from)? {
                    Some(n) => n,
                    None => break,
                },
            };

            if let Some(ref bucket) = bucket {
                bucket.wait_max(n as i64, RATE_LIMIT_WAIT_MAX).await;
            }
            writer.write_all(&buf[..n]).await?;
            stats.inc_bytes_in(user_id, n as u64).await;
            total += n as u64;
        }
    } else {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = match time::timeout(read_timeout, reader.read(&mut buf)).await {
                Err(_) => return Err(timeout_error()),
                Ok(result) => result?,
            };
            if n == 0 {
                break;
            }

            if let Some(ref bucket) = bucket {
                bucket.wait_max(n as i64, RATE_LIMIT_WAIT_MAX).await;
            }
            writer.write_all(&buf[..n]).await?;
            stats.inc_bytes_in(user_id, n as u64).await;
            total += n as u64;
        }
    }

    let _ = writer.shutdown().await;
    Ok(total)
}

/// Destination-to-client copy; plain bytes in, encrypted frames out
async fn copy_downlink<R, W>(
    reader: &mut R,
    writer: &mut W,
    read_timeout: Duration,
    bucket: Option<Arc<Bucket>>,
    stats: &StatsService,
    user_id: u32,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        let n = match time::timeout(read_timeout, reader.read(&mut buf)).await {
            Err(_) => return Err(timeout_error()),
            Ok(result) => result?,
        };
        if n == 0 {
            break;
        }

        if let Some(ref bucket) = bucket {
            bucket.wait_max(n as i64, RATE_LIMIT_WAIT_MAX).await;
        }
        writer.write_all(&buf[..n]).await?;
        stats.inc_bytes_out(user_id, n as u64).await;
        total += n as u64;
    }

    let _ = writer.shutdown().await;
    Ok(total)
}
