//! TCP relay protocol
//!
//! Client to server, one connection:
//!
//! ```plain
//! user_id(4, BE) || iv || enc( address [|| hmac10] ) || enc( payload )
//! ```
//!
//! With one-time auth the uplink payload is framed into authenticated
//! chunks; the downlink (`iv || enc(payload)`) never carries MACs.

use std::io::{self, ErrorKind};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{hmac_sha1_tag, CipherError, HMAC_SHA1_TAG_LEN};
use crate::relay::address::{Address, AddressError};

pub use self::crypto_io::CryptoStream;
pub use self::proxy_stream::{ProxyClientStream, ProxyClientWriteHalf};

pub mod crypto_io;
pub mod proxy_stream;

/// Plain-side copy buffer size for bridged connections
pub const BUFFER_SIZE: usize = 16 * 1024;

/// TCP relay protocol errors
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("{0}")]
    CipherError(#[from] CipherError),
    #[error("{0}")]
    AddressError(#[from] AddressError),
    #[error("one-time auth verification failed")]
    AuthFailed,
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> io::Error {
        match err {
            ProtocolError::IoError(err) => err,
            e => io::Error::new(ErrorKind::InvalidData, e),
        }
    }
}

/// The decoded head of a proxied connection
#[derive(Debug)]
pub struct Request {
    pub addr: Address,
    /// one-time auth in effect for this connection (signaled by the
    /// client or demanded by server configuration)
    pub ota: bool,
}

/// Read and verify the request head of an accepted connection.
///
/// Decoding the address pulls the client IV off the stream as a side
/// effect; the header tag that may follow is keyed by `iv || key`. With
/// `require_ota` the tag is verified even when the client did not flag
/// it, which fails the connection unless the client really authenticated.
pub async fn read_request<S>(stream: &mut CryptoStream<S>, require_ota: bool) -> Result<Request, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut raw = BytesMut::new();
    let (addr, flagged) = Address::read_from(stream, Some(&mut raw)).await?;

    let ota = flagged || require_ota;
    if ota {
        let mut tag = [0u8; HMAC_SHA1_TAG_LEN];
        stream.read_exact(&mut tag).await?;

        let peer_iv = match stream.peer_iv() {
            Some(iv) => iv,
            None => return Err(io::Error::new(ErrorKind::InvalidData, "no iv before request head").into()),
        };

        let mut tag_key = Vec::with_capacity(peer_iv.len() + stream.key().len());
        tag_key.extend_from_slice(&peer_iv);
        tag_key.extend_from_slice(stream.key());

        if hmac_sha1_tag(&tag_key, &raw) != tag {
            return Err(ProtocolError::AuthFailed);
        }
    }

    Ok(Request { addr, ota })
}

/// Serialized request head for the client side: address, optionally
/// followed by its tag keyed with `iv || key`
pub fn make_request_head(addr: &Address, ota: bool, key: &[u8], local_iv: &[u8]) -> BytesMut {
    let mut head = BytesMut::with_capacity(addr.serialized_len() + HMAC_SHA1_TAG_LEN);
    addr.write_to_buf(ota, &mut head);

    if ota {
        let mut tag_key = Vec::with_capacity(local_iv.len() + key.len());
        tag_key.extend_from_slice(local_iv);
        tag_key.extend_from_slice(key);
        head.put_slice(&hmac_sha1_tag(&tag_key, &head));
    }

    head
}

fn chunk_tag_key(iv: &[u8], chunk_id: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(iv.len() + 4);
    key.extend_from_slice(iv);
    key.extend_from_slice(&chunk_id.to_be_bytes());
    key
}

/// Uplink payload framing under one-time auth:
/// `len(2, BE) || tag(10) || data(len)`, tag keyed by `iv || chunk_id`
/// with the chunk counter starting at zero.
pub struct OtaChunkWriter {
    iv: Bytes,
    chunk_id: u32,
}

impl OtaChunkWriter {
    pub fn new(iv: Bytes) -> OtaChunkWriter {
        OtaChunkWriter { iv, chunk_id: 0 }
    }

    /// Frame one chunk and send it as a single write
    pub async fn write_chunk<W>(&mut self, writer: &mut W, data: &[u8]) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        debug_assert!(data.len() <= u16::MAX as usize);

        let mut frame = BytesMut::with_capacity(2 + HMAC_SHA1_TAG_LEN + data.len());
        frame.put_u16(data.len() as u16);
        frame.put_slice(&hmac_sha1_tag(&chunk_tag_key(&self.iv, self.chunk_id), data));
        frame.put_slice(data);
        self.chunk_id = self.chunk_id.wrapping_add(1);

        writer.write_all(&frame).await
    }
}

/// Verifying reader for the authenticated uplink framing
pub struct OtaChunkReader {
    iv: Bytes,
    chunk_id: u32,
}

impl OtaChunkReader {
    pub fn new(iv: Bytes) -> OtaChunkReader {
        OtaChunkReader { iv, chunk_id: 0 }
    }

    /// Read and verify the next chunk into `buf`, growing it as needed.
    /// Returns the chunk length, or `None` on a clean end of stream at a
    /// chunk boundary. A tag mismatch is fatal.
    pub async fn read_chunk<R>(&mut self, reader: &mut R, buf: &mut Vec<u8>) -> Result<Option<usize>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 2 + HMAC_SHA1_TAG_LEN];

        // EOF exactly between chunks ends the stream; EOF inside a chunk
        // is a truncation error
        let n = reader.read(&mut head[..1]).await?;
        if n == 0 {
            return Ok(None);
        }
        reader.read_exact(&mut head[1..]).await?;

        let len = u16::from_be_bytes([head[0], head[1]]) as usize;
        let tag = &head[2..];

        if buf.len() < len {
            buf.resize(len, 0);
        }
        reader.read_exact(&mut buf[..len]).await?;

        if hmac_sha1_tag(&chunk_tag_key(&self.iv, self.chunk_id), &buf[..len]) != tag {
            return Err(ProtocolError::AuthFailed);
        }
        self.chunk_id = self.chunk_id.wrapping_add(1);

        Ok(Some(len))
    }
}
