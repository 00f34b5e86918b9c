//! UDP relay protocol
//!
//! Every datagram stands alone:
//!
//! ```plain
//! client -> server: user_id(4, BE) || iv || enc( address || data [|| hmac10] )
//! server -> client:                   iv || enc( address || data [|| hmac10] )
//! ```
//!
//! A fresh IV and a throwaway cipher state are used for every datagram in
//! both directions, so concurrent sends on a shared socket never share
//! encrypt state.

use std::io::{self, Cursor, ErrorKind};

use bytes::{BufMut, BytesMut};
use rand::RngCore;

use crate::buffer::UDP_BUFFER_SIZE;
use crate::crypto::{hmac_sha1_tag, new_stream, CipherKind, CryptoMode, HMAC_SHA1_TAG_LEN};
use crate::relay::address::Address;
use crate::relay::{user_id_to_bytes, USER_ID_LEN};

pub use self::nat::{NatEntry, NatMap};

pub mod nat;

/// Maximum datagram size on the wire, matching the buffer pool
pub const MAX_DATAGRAM_SIZE: usize = UDP_BUFFER_SIZE;

/// A decrypted inbound datagram
#[derive(Debug)]
pub struct Datagram {
    pub addr: Address,
    /// the datagram carried a one-time-auth tag (and it verified)
    pub ota: bool,
    /// application payload, address header and tag stripped
    pub payload: BytesMut,
}

/// Encrypt one datagram. `user_id` is prepended on the client-to-server
/// direction only.
pub fn encrypt_datagram(
    method: CipherKind,
    key: &[u8],
    addr: &Address,
    payload: &[u8],
    ota: bool,
    user_id: Option<u32>,
    dst: &mut BytesMut,
) {
    let iv_len = method.iv_len();

    let mut plaintext = BytesMut::with_capacity(addr.serialized_len() + payload.len() + HMAC_SHA1_TAG_LEN);
    addr.write_to_buf(ota, &mut plaintext);
    plaintext.put_slice(payload);

    let mut iv = vec![0u8; iv_len];
    rand::thread_rng().fill_bytes(&mut iv);

    if ota {
        let mut tag_key = Vec::with_capacity(iv_len + key.len());
        tag_key.extend_from_slice(&iv);
        tag_key.extend_from_slice(key);
        let tag = hmac_sha1_tag(&tag_key, &plaintext);
        plaintext.put_slice(&tag);
    }

    new_stream(method, key, &iv, CryptoMode::Encrypt).process(&mut plaintext);

    dst.reserve(USER_ID_LEN + iv_len + plaintext.len());
    if let Some(user_id) = user_id {
        dst.put_slice(&user_id_to_bytes(user_id));
    }
    dst.put_slice(&iv);
    dst.put_slice(&plaintext);
}

/// Decrypt one datagram (the user id, if any, already stripped).
///
/// `require_ota` forces tag verification even when the address byte does
/// not flag it, mirroring the TCP handshake.
pub async fn decrypt_datagram(
    method: CipherKind,
    key: &[u8],
    data: &[u8],
    require_ota: bool,
) -> io::Result<Datagram> {
    let iv_len = method.iv_len();
    if data.len() < iv_len {
        return Err(io::Error::new(ErrorKind::InvalidData, "datagram too short: cannot decrypt"));
    }

    let (iv, ciphertext) = data.split_at(iv_len);
    let mut plaintext = BytesMut::from(ciphertext);
    new_stream(method, key, iv, CryptoMode::Decrypt).process(&mut plaintext);

    let mut cursor = Cursor::new(&plaintext[..]);
    let (addr, flagged) = Address::read_from(&mut cursor, None)
        .await
        .map_err(io::Error::from)?;
    let addr_len = cursor.position() as usize;

    let ota = flagged || require_ota;
    if ota {
        if plaintext.len() < addr_len + HMAC_SHA1_TAG_LEN {
            return Err(io::Error::new(ErrorKind::InvalidData, "datagram too short for auth tag"));
        }

        let tag_start = plaintext.len() - HMAC_SHA1_TAG_LEN;
        let mut tag_key = Vec::with_capacity(iv_len + key.len());
        tag_key.extend_from_slice(iv);
        tag_key.extend_from_slice(key);

        if hmac_sha1_tag(&tag_key, &plaintext[..tag_start]) != plaintext[tag_start..] {
            return Err(io::Error::new(ErrorKind::InvalidData, "datagram auth failed"));
        }
        plaintext.truncate(tag_start);
    }

    let _ = plaintext.split_to(addr_len);
    Ok(Datagram {
        addr,
        ota,
        payload: plaintext,
    })
}
