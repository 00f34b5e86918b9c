//! Keyed stream-cipher states
//!
//! Every supported method is a stream cipher: block ciphers run in CFB or
//! CTR streaming mode, never as raw blocks. CFB needs distinct encrypt and
//! decrypt states, the pure keystream ciphers are direction-agnostic.

use aes::{Aes128, Aes192, Aes256};
use cfb_mode::{BufDecryptor, BufEncryptor};
use chacha20::{ChaCha20, ChaCha20Legacy};
use chacha20::cipher::{NewCipher as ChaChaNewCipher, StreamCipher as ChaChaStreamCipher};
use cipher::generic_array::GenericArray;
use cipher::{BlockCipher, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use rc4::consts::U16;
use rc4::{KeyInit, Rc4};
use salsa20::Salsa20;

use super::{cipher::CipherKind, CryptoMode};

/// An initialized stream-cipher state for one direction of one connection
/// (or one datagram). Operates in place; a stream cipher never changes the
/// data length.
pub trait StreamCrypter: Send + Sync {
    fn process(&mut self, data: &mut [u8]);
}

pub type BoxStreamCrypter = Box<dyn StreamCrypter + 'static>;

struct CfbEncrypter<C>(BufEncryptor<C>)
where
    C: BlockEncryptMut + BlockCipher;

impl<C> StreamCrypter for CfbEncrypter<C>
where
    C: BlockEncryptMut + BlockCipher + Send + Sync,
{
    fn process(&mut self, data: &mut [u8]) {
        self.0.encrypt(data);
    }
}

struct CfbDecrypter<C>(BufDecryptor<C>)
where
    C: BlockEncryptMut + BlockCipher;

impl<C> StreamCrypter for CfbDecrypter<C>
where
    C: BlockEncryptMut + BlockCipher + Send + Sync,
{
    fn process(&mut self, data: &mut [u8]) {
        self.0.decrypt(data);
    }
}

/// Pure keystream ciphers XOR the same stream for both directions
struct Keystream<C>(C);

impl<C> StreamCrypter for Keystream<C>
where
    C: cipher::StreamCipher + Send + Sync,
{
    fn process(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

/// The chacha20 crate's legacy/IETF ciphers are built on an older, separate
/// `cipher` crate major version than the rest of this module, so they need
/// their own trait bounds even though the operation is identical.
struct ChaChaKeystream<C>(C);

impl<C> StreamCrypter for ChaChaKeystream<C>
where
    C: ChaChaStreamCipher + Send + Sync,
{
    fn process(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

macro_rules! cfb {
    ($cipher:ty, $key:expr, $iv:expr, $mode:expr) => {
        match $mode {
            CryptoMode::Encrypt => Box::new(CfbEncrypter(
                BufEncryptor::<$cipher>::new_from_slices($key, $iv).expect("valid key/iv length"),
            )) as BoxStreamCrypter,
            CryptoMode::Decrypt => Box::new(CfbDecrypter(
                BufDecryptor::<$cipher>::new_from_slices($key, $iv).expect("valid key/iv length"),
            )),
        }
    };
}

macro_rules! keystream {
    ($cipher:ty, $key:expr, $iv:expr) => {
        Box::new(Keystream(
            <$cipher>::new_from_slices($key, $iv).expect("valid key/iv length"),
        )) as BoxStreamCrypter
    };
}

macro_rules! chacha_keystream {
    ($cipher:ty, $key:expr, $iv:expr) => {
        Box::new(ChaChaKeystream(
            <$cipher as ChaChaNewCipher>::new_from_slices($key, $iv).expect("valid key/iv length"),
        )) as BoxStreamCrypter
    };
}

/// Build a keyed stream-cipher state. `key` and `iv` must already have the
/// exact lengths declared by the method.
pub fn new_stream(method: CipherKind, key: &[u8], iv: &[u8], mode: CryptoMode) -> BoxStreamCrypter {
    debug_assert_eq!(key.len(), method.key_len());
    debug_assert_eq!(iv.len(), method.iv_len());

    match method {
        CipherKind::Aes128Cfb => cfb!(Aes128, key, iv, mode),
        CipherKind::Aes192Cfb => cfb!(Aes192, key, iv, mode),
        CipherKind::Aes256Cfb => cfb!(Aes256, key, iv, mode),

        CipherKind::Aes128Ctr => keystream!(ctr::Ctr128BE<Aes128>, key, iv),
        CipherKind::Aes192Ctr => keystream!(ctr::Ctr128BE<Aes192>, key, iv),
        CipherKind::Aes256Ctr => keystream!(ctr::Ctr128BE<Aes256>, key, iv),

        CipherKind::ChaCha20 => chacha_keystream!(ChaCha20Legacy, key, iv),
        CipherKind::ChaCha20Ietf => chacha_keystream!(ChaCha20, key, iv),
        CipherKind::Salsa20 => keystream!(Salsa20, key, iv),

        CipherKind::Rc4Md5 => {
            // rc4-md5 keys the RC4 stream with MD5(key || iv), which is what
            // makes the IV matter for a cipher that has no nonce of its own
            let mut hasher = Md5::new();
            hasher.update(key);
            hasher.update(iv);
            let session_key = hasher.finalize();
            Box::new(Keystream(Rc4::<U16>::new(GenericArray::from_slice(&session_key))))
        }
    }
}
