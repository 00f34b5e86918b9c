//! Cipher methods and per-connection cipher instances

use std::fmt::{self, Display};
use std::str::FromStr;

use bytes::Bytes;
use rand::RngCore;

use super::stream::{new_stream, BoxStreamCrypter};
use super::{bytes_to_key, CryptoMode};

/// Cipher errors
#[derive(thiserror::Error, Debug)]
pub enum CipherError {
    #[error("cipher method {0:?} not supported")]
    UnknownMethod(String),
    #[error("invalid iv length {got}, method wants {expected}")]
    IvLength { expected: usize, got: usize },
    #[error("decrypt state already initialized with a different iv")]
    DecryptReinitialized,
    #[error("decrypt state not initialized")]
    DecryptNotInitialized,
}

/// Supported cipher methods, named by their configuration identifiers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CipherKind {
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    ChaCha20,
    ChaCha20Ietf,
    Rc4Md5,
    Salsa20,
}

impl CipherKind {
    /// Key length in bytes
    #[rustfmt::skip]
    pub fn key_len(self) -> usize {
        match self {
            CipherKind::Aes128Cfb    => 16,
            CipherKind::Aes192Cfb    => 24,
            CipherKind::Aes256Cfb    => 32,
            CipherKind::Aes128Ctr    => 16,
            CipherKind::Aes192Ctr    => 24,
            CipherKind::Aes256Ctr    => 32,
            CipherKind::ChaCha20     => 32,
            CipherKind::ChaCha20Ietf => 32,
            CipherKind::Rc4Md5       => 16,
            CipherKind::Salsa20      => 32,
        }
    }

    /// Initialization vector length in bytes
    #[rustfmt::skip]
    pub fn iv_len(self) -> usize {
        match self {
            CipherKind::Aes128Cfb    => 16,
            CipherKind::Aes192Cfb    => 16,
            CipherKind::Aes256Cfb    => 16,
            CipherKind::Aes128Ctr    => 16,
            CipherKind::Aes192Ctr    => 16,
            CipherKind::Aes256Ctr    => 16,
            CipherKind::ChaCha20     => 8,
            CipherKind::ChaCha20Ietf => 12,
            CipherKind::Rc4Md5       => 16,
            CipherKind::Salsa20      => 8,
        }
    }

    #[rustfmt::skip]
    pub fn name(self) -> &'static str {
        match self {
            CipherKind::Aes128Cfb    => "aes-128-cfb",
            CipherKind::Aes192Cfb    => "aes-192-cfb",
            CipherKind::Aes256Cfb    => "aes-256-cfb",
            CipherKind::Aes128Ctr    => "aes-128-ctr",
            CipherKind::Aes192Ctr    => "aes-192-ctr",
            CipherKind::Aes256Ctr    => "aes-256-ctr",
            CipherKind::ChaCha20     => "chacha20",
            CipherKind::ChaCha20Ietf => "chacha20-ietf",
            CipherKind::Rc4Md5       => "rc4-md5",
            CipherKind::Salsa20      => "salsa20",
        }
    }
}

impl Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherKind {
    type Err = CipherError;

    #[rustfmt::skip]
    fn from_str(s: &str) -> Result<CipherKind, CipherError> {
        match s {
            "aes-128-cfb"   => Ok(CipherKind::Aes128Cfb),
            "aes-192-cfb"   => Ok(CipherKind::Aes192Cfb),
            "aes-256-cfb"   => Ok(CipherKind::Aes256Cfb),
            "aes-128-ctr"   => Ok(CipherKind::Aes128Ctr),
            "aes-192-ctr"   => Ok(CipherKind::Aes192Ctr),
            "aes-256-ctr"   => Ok(CipherKind::Aes256Ctr),
            "chacha20"      => Ok(CipherKind::ChaCha20),
            "chacha20-ietf" => Ok(CipherKind::ChaCha20Ietf),
            "rc4-md5"       => Ok(CipherKind::Rc4Md5),
            "salsa20"       => Ok(CipherKind::Salsa20),
            _ => Err(CipherError::UnknownMethod(s.to_owned())),
        }
    }
}

/// A cipher instance for one peer
///
/// Owns the password-derived key and two lazily initialized stream halves.
/// The encrypt half generates its IV on first use, the decrypt half is
/// primed with the IV read off the wire. `duplicate` produces an instance
/// sharing the same key material with both halves uninitialized, which is
/// what every new connection starts from.
pub struct Cipher {
    method: CipherKind,
    key: Box<[u8]>,
    enc: Option<BoxStreamCrypter>,
    enc_iv: Option<Bytes>,
    dec: Option<BoxStreamCrypter>,
    dec_iv: Option<Bytes>,
}

impl Cipher {
    /// Create a cipher from a method name and password
    pub fn new(method: &str, password: &str) -> Result<Cipher, CipherError> {
        let method = method.parse::<CipherKind>()?;
        Ok(Cipher::from_method(method, password))
    }

    pub fn from_method(method: CipherKind, password: &str) -> Cipher {
        let key = bytes_to_key(password.as_bytes(), method.key_len());
        Cipher {
            method,
            key,
            enc: None,
            enc_iv: None,
            dec: None,
            dec_iv: None,
        }
    }

    /// Fresh instance with the same key and uninitialized halves
    pub fn duplicate(&self) -> Cipher {
        Cipher {
            method: self.method,
            key: self.key.clone(),
            enc: None,
            enc_iv: None,
            dec: None,
            dec_iv: None,
        }
    }

    pub fn method(&self) -> CipherKind {
        self.method
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Prime the encrypt half with a fresh random IV and return it.
    /// Subsequent calls return the IV of the first call.
    pub fn init_encrypt(&mut self) -> Bytes {
        if let Some(ref iv) = self.enc_iv {
            return iv.clone();
        }

        let mut iv = vec![0u8; self.method.iv_len()];
        rand::thread_rng().fill_bytes(&mut iv);
        let iv = Bytes::from(iv);

        self.enc = Some(new_stream(self.method, &self.key, &iv, CryptoMode::Encrypt));
        self.enc_iv = Some(iv.clone());
        iv
    }

    /// Prime the decrypt half with the peer's IV. Idempotent for the same
    /// IV; a second, different IV is an error.
    pub fn init_decrypt(&mut self, iv: &[u8]) -> Result<(), CipherError> {
        if iv.len() != self.method.iv_len() {
            return Err(CipherError::IvLength {
                expected: self.method.iv_len(),
                got: iv.len(),
            });
        }

        if let Some(ref cur) = self.dec_iv {
            if cur.as_ref() == iv {
                return Ok(());
            }
            return Err(CipherError::DecryptReinitialized);
        }

        self.dec = Some(new_stream(self.method, &self.key, iv, CryptoMode::Decrypt));
        self.dec_iv = Some(Bytes::copy_from_slice(iv));
        Ok(())
    }

    pub fn encrypt_iv(&self) -> Option<&Bytes> {
        self.enc_iv.as_ref()
    }

    pub fn decrypt_iv(&self) -> Option<&Bytes> {
        self.dec_iv.as_ref()
    }

    /// Encrypt in place, priming the encrypt half if necessary
    pub fn encrypt(&mut self, data: &mut [u8]) {
        if self.enc.is_none() {
            self.init_encrypt();
        }
        if let Some(ref mut enc) = self.enc {
            enc.process(data);
        }
    }

    /// Decrypt in place. The decrypt half must have been primed.
    pub fn decrypt(&mut self, data: &mut [u8]) -> Result<(), CipherError> {
        match self.dec {
            Some(ref mut dec) => {
                dec.process(data);
                Ok(())
            }
            None => Err(CipherError::DecryptNotInitialized),
        }
    }
}

impl Drop for Cipher {
    fn drop(&mut self) {
        // key material does not outlive the instance (cache eviction included)
        self.key.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip_via_instance_pair() {
        let server = Cipher::new("aes-256-cfb", "pwd").unwrap();
        let mut client = server.duplicate();
        let mut server = server.duplicate();

        let iv = client.init_encrypt();
        let mut data = b"ping".to_vec();
        client.encrypt(&mut data);

        server.init_decrypt(&iv).unwrap();
        server.decrypt(&mut data).unwrap();
        assert_eq!(&data, b"ping");
    }

    #[test]
    fn init_encrypt_is_idempotent() {
        let mut c = Cipher::new("chacha20", "pwd").unwrap();
        let iv1 = c.init_encrypt();
        let iv2 = c.init_encrypt();
        assert_eq!(iv1, iv2);
        assert_eq!(iv1.len(), 8);
    }

    #[test]
    fn init_decrypt_rejects_second_iv() {
        let mut c = Cipher::new("rc4-md5", "pwd").unwrap();
        c.init_decrypt(&[1u8; 16]).unwrap();
        assert!(c.init_decrypt(&[1u8; 16]).is_ok());
        assert!(matches!(
            c.init_decrypt(&[2u8; 16]),
            Err(CipherError::DecryptReinitialized)
        ));
    }

    #[test]
    fn decrypt_requires_priming() {
        let mut c = Cipher::new("salsa20", "pwd").unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            c.decrypt(&mut buf),
            Err(CipherError::DecryptNotInitialized)
        ));
    }

    #[test]
    fn duplicate_shares_key_not_state() {
        let mut a = Cipher::new("aes-128-ctr", "pwd").unwrap();
        let iv_a = a.init_encrypt();

        let mut b = a.duplicate();
        assert_eq!(a.key(), b.key());
        assert!(b.encrypt_iv().is_none());

        let iv_b = b.init_encrypt();
        assert_ne!(iv_a, iv_b);
    }

    #[test]
    fn unknown_method_is_rejected() {
        assert!(matches!(
            Cipher::new("aes-256-gcm", "pwd"),
            Err(CipherError::UnknownMethod(_))
        ));
    }
}
