//! Relay protocol implementation

pub use self::address::{Address, AddressError};

pub mod address;
pub mod tcprelay;
pub mod udprelay;

/// Size of the plaintext user id that precedes the ciphertext on every
/// client-to-server connection and datagram
pub const USER_ID_LEN: usize = 4;

/// Encode a user id the way it travels on the wire
pub fn user_id_to_bytes(user_id: u32) -> [u8; USER_ID_LEN] {
    user_id.to_be_bytes()
}

/// Decode a wire user id
pub fn user_id_from_bytes(buf: [u8; USER_ID_LEN]) -> u32 {
    u32::from_be_bytes(buf)
}
