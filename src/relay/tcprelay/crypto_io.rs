//! Encrypted stream transport
//!
//! Each direction of a connection is `IV || ciphertext`. The writer sends
//! its IV in front of the first encrypted chunk; the reader consumes the
//! peer's IV off the stream before decrypting anything. Once learned, the
//! IVs never change for the lifetime of the connection.

use std::io::{self, ErrorKind};
use std::pin::Pin;
use std::task::{Context, Poll};

use byte_string::ByteStr;
use bytes::{Bytes, BytesMut};
use futures::ready;
use log::trace;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::Cipher;

use super::ProtocolError;

enum ReadState {
    /// Accumulating the peer's IV
    WaitIv { buf: Vec<u8>, pos: usize },
    Established,
}

enum WriteState {
    AssemblePacket,
    Writing { pos: usize },
}

/// A byte stream that encrypts writes and decrypts reads
///
/// The generic transport only needs to be a `ReadWriteClose`; the engine
/// passes plain TCP here, an external reliable-UDP pipe works the same.
pub struct CryptoStream<S> {
    stream: S,
    cipher: Cipher,
    read_state: ReadState,
    write_state: WriteState,
    write_buf: BytesMut,
}

impl<S> CryptoStream<S> {
    /// Wrap a connected stream. The encrypt half is primed immediately so
    /// the local IV is known up front; it still only hits the wire with
    /// the first write.
    pub fn new(stream: S, mut cipher: Cipher) -> CryptoStream<S> {
        let local_iv = cipher.init_encrypt();
        trace!("generated stream iv {:?}", ByteStr::new(&local_iv));

        let mut write_buf = BytesMut::with_capacity(local_iv.len());
        write_buf.extend_from_slice(&local_iv);

        let iv_len = cipher.method().iv_len();
        CryptoStream {
            stream,
            cipher,
            read_state: ReadState::WaitIv {
                buf: vec![0u8; iv_len],
                pos: 0,
            },
            write_state: WriteState::AssemblePacket,
            write_buf,
        }
    }

    /// IV this side sends (generated at construction)
    pub fn local_iv(&self) -> Bytes {
        self.cipher.encrypt_iv().cloned().unwrap_or_else(Bytes::new)
    }

    /// IV the peer sent, once the first read has consumed it
    pub fn peer_iv(&self) -> Option<Bytes> {
        self.cipher.decrypt_iv().cloned()
    }

    pub fn key(&self) -> &[u8] {
        self.cipher.key()
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> CryptoStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read_iv(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), ProtocolError>> {
        loop {
            match self.read_state {
                ReadState::WaitIv { ref mut buf, ref mut pos } => {
                    while *pos < buf.len() {
                        let mut read_buf = ReadBuf::new(&mut buf[*pos..]);
                        ready!(Pin::new(&mut self.stream).poll_read(cx, &mut read_buf))?;
                        let n = read_buf.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::Error::from(ErrorKind::UnexpectedEof).into()));
                        }
                        *pos += n;
                    }

                    trace!("got peer stream iv {:?}", ByteStr::new(buf));
                    let iv = std::mem::take(buf);
                    self.cipher.init_decrypt(&iv)?;
                    self.read_state = ReadState::Established;
                }
                ReadState::Established => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl<S> AsyncRead for CryptoStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_read_iv(cx)).map_err(io::Error::from)?;

        let filled_before = buf.filled().len();
        ready!(Pin::new(&mut this.stream).poll_read(cx, buf))?;

        let incoming = &mut buf.filled_mut()[filled_before..];
        if !incoming.is_empty() {
            this.cipher.decrypt(incoming).map_err(ProtocolError::from).map_err(io::Error::from)?;
        }

        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncWrite for CryptoStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match this.write_state {
                WriteState::AssemblePacket => {
                    let n = this.write_buf.len();
                    this.write_buf.extend_from_slice(buf);
                    this.cipher.encrypt(&mut this.write_buf[n..]);
                    this.write_state = WriteState::Writing { pos: 0 };
                }
                WriteState::Writing { ref mut pos } => {
                    while *pos < this.write_buf.len() {
                        let n = ready!(Pin::new(&mut this.stream).poll_write(cx, &this.write_buf[*pos..]))?;
                        if n == 0 {
                            return Poll::Ready(Err(ErrorKind::WriteZero.into()));
                        }
                        *pos += n;
                    }

                    this.write_state = WriteState::AssemblePacket;
                    this.write_buf.clear();
                    return Poll::Ready(Ok(buf.len()));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
