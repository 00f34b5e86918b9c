//! Client-side stream connected through a remote relay server

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use log::trace;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::crypto::Cipher;
use crate::relay::address::Address;
use crate::relay::user_id_to_bytes;

use super::crypto_io::CryptoStream;
use super::{make_request_head, OtaChunkWriter};

/// An established connection to a relay server, ready to carry payload
/// for one destination
pub struct ProxyClientStream<S = TcpStream> {
    stream: CryptoStream<S>,
    ota: bool,
}

impl ProxyClientStream<TcpStream> {
    /// Dial `server_addr` and perform the request handshake for `target`.
    ///
    /// Writes the plaintext user id, then the IV-prefixed encrypted
    /// request head (with its auth tag when `ota`).
    pub async fn connect(
        server_addr: &str,
        cipher: Cipher,
        user_id: u32,
        target: &Address,
        ota: bool,
    ) -> io::Result<ProxyClientStream<TcpStream>> {
        let stream = TcpStream::connect(server_addr).await?;
        trace!("connected relay server {server_addr}, target {target}");
        ProxyClientStream::handshake(stream, cipher, user_id, target, ota).await
    }
}

impl<S> ProxyClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Perform the handshake on an already-connected transport. This is
    /// the seam an external byte-pipe transport plugs into.
    pub async fn handshake(
        mut stream: S,
        cipher: Cipher,
        user_id: u32,
        target: &Address,
        ota: bool,
    ) -> io::Result<ProxyClientStream<S>> {
        stream.write_all(&user_id_to_bytes(user_id)).await?;

        let mut stream = CryptoStream::new(stream, cipher);
        let head = make_request_head(target, ota, stream.key(), &stream.local_iv());
        stream.write_all(&head).await?;

        Ok(ProxyClientStream { stream, ota })
    }

    pub fn is_ota(&self) -> bool {
        self.ota
    }

    pub fn local_iv(&self) -> Bytes {
        self.stream.local_iv()
    }

    /// Split for bidirectional bridging. The write half frames payload
    /// into authenticated chunks when one-time auth is in effect.
    pub fn into_split(self) -> (ReadHalf<CryptoStream<S>>, ProxyClientWriteHalf<S>) {
        let ota = self.ota.then(|| OtaChunkWriter::new(self.stream.local_iv()));
        let (r, w) = tokio::io::split(self.stream);
        (r, ProxyClientWriteHalf { inner: w, ota })
    }
}

impl<S> AsyncRead for ProxyClientStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

/// Uplink half of a split client stream
pub struct ProxyClientWriteHalf<S> {
    inner: WriteHalf<CryptoStream<S>>,
    ota: Option<OtaChunkWriter>,
}

impl<S> ProxyClientWriteHalf<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send one chunk of payload upstream, framed when authenticated
    pub async fn write_payload(&mut self, data: &[u8]) -> io::Result<()> {
        match self.ota {
            Some(ref mut framer) => framer.write_chunk(&mut self.inner, data).await,
            None => self.inner.write_all(data).await,
        }
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
