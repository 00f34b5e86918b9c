//! Ciphers

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;

pub use self::cipher::{Cipher, CipherError, CipherKind};
pub use self::stream::{new_stream, BoxStreamCrypter, StreamCrypter};

pub mod cipher;
pub mod stream;

/// Length of the truncated HMAC-SHA1 tag attached to authenticated
/// headers, payload chunks and datagrams
pub const HMAC_SHA1_TAG_LEN: usize = 10;

/// Direction of a stream cipher state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CryptoMode {
    Encrypt,
    Decrypt,
}

/// Derive a fixed-length key from a password with repeated MD5 stretching
///
/// `K0 = MD5(password)`, `Ki = MD5(Ki-1 || password)`, concatenated and
/// truncated to `key_len`. This is OpenSSL's `EVP_BytesToKey(3)` with MD5
/// and no salt, which every shadowsocks implementation agrees on.
pub fn bytes_to_key(password: &[u8], key_len: usize) -> Box<[u8]> {
    let mut key = Vec::with_capacity(key_len + 15);
    let mut last: Option<[u8; 16]> = None;

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if let Some(ref l) = last {
            hasher.update(l);
        }
        hasher.update(password);

        let digest = hasher.finalize();
        key.extend_from_slice(&digest);
        last = Some(digest.into());
    }

    key.truncate(key_len);
    key.into_boxed_slice()
}

/// Truncated `HMAC-SHA1(key, message)` authentication tag
pub fn hmac_sha1_tag(key: &[u8], message: &[u8]) -> [u8; HMAC_SHA1_TAG_LEN] {
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key).expect("HMAC-SHA1 accepts any key length");
    mac.update(message);

    let digest = mac.finalize().into_bytes();
    let mut tag = [0u8; HMAC_SHA1_TAG_LEN];
    tag.copy_from_slice(&digest[..HMAC_SHA1_TAG_LEN]);
    tag
}
