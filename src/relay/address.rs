//! Destination address header
//!
//! The first plaintext bytes of a TCP connection, and of every UDP
//! datagram, name the destination the client wants reached:
//!
//! ```plain
//! +------+----------+----------+
//! | ATYP |  ADDR    |  PORT    |
//! +------+----------+----------+
//! |  1   | Variable |    2     |
//! +------+----------+----------+
//! ```
//!
//! `ATYP` is `0x01` (IPv4), `0x03` (domain name, one length byte followed
//! by the name) or `0x04` (IPv6); its high bit (`0x10`) signals that the
//! message carries a one-time-auth tag.

use std::fmt::{self, Debug, Display, Formatter};
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::vec;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

#[rustfmt::skip]
mod consts {
    pub const ADDR_TYPE_IPV4:        u8 = 0x01;
    pub const ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
    pub const ADDR_TYPE_IPV6:        u8 = 0x04;

    /// Low nibble carries the address type
    pub const ADDR_TYPE_MASK:        u8 = 0x0F;
    /// High bit of the type byte flags one-time auth
    pub const ONE_TIME_AUTH_MASK:    u8 = 0x10;
}

pub use self::consts::ONE_TIME_AUTH_MASK;

/// Address header errors
#[derive(thiserror::Error, Debug)]
pub enum AddressError {
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("address type {0:#x} not supported")]
    UnsupportedType(u8),
    #[error("domain name of length zero")]
    EmptyDomainName,
    #[error("domain name must be UTF-8")]
    InvalidDomainEncoding,
}

impl From<AddressError> for io::Error {
    fn from(err: AddressError) -> io::Error {
        match err {
            AddressError::IoError(err) => err,
            e => io::Error::new(ErrorKind::InvalidData, e),
        }
    }
}

/// A destination, either a socket address or a named host with port
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Address {
    SocketAddress(SocketAddr),
    DomainNameAddress(String, u16),
}

impl Address {
    /// Decode an address from a plaintext stream. Returns the address and
    /// whether the type byte carried the one-time-auth flag; `raw` (when
    /// given) collects the exact header bytes for authentication.
    pub async fn read_from<R>(stream: &mut R, raw: Option<&mut BytesMut>) -> Result<(Address, bool), AddressError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut type_buf = [0u8; 1];
        stream.read_exact(&mut type_buf).await?;

        let type_byte = type_buf[0];
        let ota = type_byte & consts::ONE_TIME_AUTH_MASK != 0;

        let addr = match type_byte & consts::ADDR_TYPE_MASK {
            consts::ADDR_TYPE_IPV4 => {
                let mut buf = [0u8; 6];
                stream.read_exact(&mut buf).await?;
                if let Some(raw) = raw {
                    raw.put_u8(type_byte);
                    raw.put_slice(&buf);
                }

                let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            }
            consts::ADDR_TYPE_IPV6 => {
                let mut buf = [0u8; 18];
                stream.read_exact(&mut buf).await?;
                if let Some(raw) = raw {
                    raw.put_u8(type_byte);
                    raw.put_slice(&buf);
                }

                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[..16]);
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(ip), port, 0, 0)))
            }
            consts::ADDR_TYPE_DOMAIN_NAME => {
                let mut len_buf = [0u8; 1];
                stream.read_exact(&mut len_buf).await?;
                let name_len = len_buf[0] as usize;
                if name_len == 0 {
                    return Err(AddressError::EmptyDomainName);
                }

                let mut buf = vec![0u8; name_len + 2];
                stream.read_exact(&mut buf).await?;
                if let Some(raw) = raw {
                    raw.put_u8(type_byte);
                    raw.put_u8(len_buf[0]);
                    raw.put_slice(&buf);
                }

                let port = u16::from_be_bytes([buf[name_len], buf[name_len + 1]]);
                buf.truncate(name_len);
                let name = String::from_utf8(buf).map_err(|_| AddressError::InvalidDomainEncoding)?;
                Address::DomainNameAddress(name, port)
            }
            t => return Err(AddressError::UnsupportedType(t)),
        };

        Ok((addr, ota))
    }

    /// Encode onto a buffer, setting the one-time-auth flag when asked
    pub fn write_to_buf<B: BufMut>(&self, ota: bool, buf: &mut B) {
        let flag = if ota { consts::ONE_TIME_AUTH_MASK } else { 0 };
        match *self {
            Address::SocketAddress(SocketAddr::V4(ref addr)) => {
                buf.put_u8(consts::ADDR_TYPE_IPV4 | flag);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::SocketAddress(SocketAddr::V6(ref addr)) => {
                buf.put_u8(consts::ADDR_TYPE_IPV6 | flag);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::DomainNameAddress(ref name, port) => {
                debug_assert!(!name.is_empty() && name.len() <= u8::MAX as usize);
                buf.put_u8(consts::ADDR_TYPE_DOMAIN_NAME | flag);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
                buf.put_u16(port);
            }
        }
    }

    /// Bytes this address occupies on the wire
    pub fn serialized_len(&self) -> usize {
        match *self {
            Address::SocketAddress(SocketAddr::V4(..)) => 1 + 4 + 2,
            Address::SocketAddress(SocketAddr::V6(..)) => 1 + 16 + 2,
            Address::DomainNameAddress(ref name, ..) => 1 + 1 + name.len() + 2,
        }
    }

    pub fn port(&self) -> u16 {
        match *self {
            Address::SocketAddress(addr) => addr.port(),
            Address::DomainNameAddress(.., port) => port,
        }
    }

    /// Host part as a string, for block-list checks and logging
    pub fn host(&self) -> String {
        match *self {
            Address::SocketAddress(ref addr) => addr.ip().to_string(),
            Address::DomainNameAddress(ref name, ..) => name.clone(),
        }
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Address::SocketAddress(ref addr) => write!(f, "{addr}"),
            Address::DomainNameAddress(ref name, port) => write!(f, "{name}:{port}"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Address {
        Address::SocketAddress(addr)
    }
}

impl From<(String, u16)> for Address {
    fn from((name, port): (String, u16)) -> Address {
        Address::DomainNameAddress(name, port)
    }
}

impl ToSocketAddrs for Address {
    type Iter = vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> io::Result<vec::IntoIter<SocketAddr>> {
        match self.clone() {
            Address::SocketAddress(addr) => Ok(vec![addr].into_iter()),
            Address::DomainNameAddress(name, port) => (name.as_str(), port).to_socket_addrs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn roundtrip(addr: Address, ota: bool) {
        let mut buf = BytesMut::new();
        addr.write_to_buf(ota, &mut buf);
        assert_eq!(buf.len(), addr.serialized_len());

        let mut cursor = Cursor::new(buf.freeze());
        let mut raw = BytesMut::new();
        let (decoded, decoded_ota) = Address::read_from(&mut cursor, Some(&mut raw)).await.unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(decoded_ota, ota);
        assert_eq!(raw.len(), addr.serialized_len());
    }

    #[tokio::test]
    async fn ipv4_roundtrip() {
        roundtrip(Address::SocketAddress("127.0.0.1:80".parse().unwrap()), false).await;
        roundtrip(Address::SocketAddress("255.255.255.255:65535".parse().unwrap()), true).await;
    }

    #[tokio::test]
    async fn ipv6_roundtrip() {
        roundtrip(Address::SocketAddress("[2404:6800:4004:80f::11]:443".parse().unwrap()), false).await;
        roundtrip(Address::SocketAddress("[::1]:1".parse().unwrap()), true).await;
    }

    #[tokio::test]
    async fn domain_roundtrip_extreme_lengths() {
        roundtrip(Address::DomainNameAddress("a".to_owned(), 1), false).await;
        roundtrip(Address::DomainNameAddress("x".repeat(255), 65535), true).await;
    }

    #[tokio::test]
    async fn zero_length_domain_is_rejected() {
        let buf = [0x03u8, 0x00, 0x1f, 0x90];
        let mut cursor = Cursor::new(&buf[..]);
        let err = Address::read_from(&mut cursor, None).await.unwrap_err();
        assert!(matches!(err, AddressError::EmptyDomainName));
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let buf = [0x07u8, 0x00, 0x00];
        let mut cursor = Cursor::new(&buf[..]);
        let err = Address::read_from(&mut cursor, None).await.unwrap_err();
        assert!(matches!(err, AddressError::UnsupportedType(0x07)));
    }

    #[tokio::test]
    async fn ota_flag_does_not_change_type_dispatch() {
        let mut buf = BytesMut::new();
        Address::SocketAddress("10.0.0.1:53".parse().unwrap()).write_to_buf(true, &mut buf);
        assert_eq!(buf[0], 0x11);
    }
}
