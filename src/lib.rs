//! An encrypted TCP/UDP tunneling proxy
//!
//! The protocol core: stream-cipher framing with optional one-time auth,
//! a per-user session layer (credentials, bandwidth buckets, traffic
//! statistics), a request-multiplexing server and a failure-scored client
//! dispatcher. The server and client binaries are thin wrappers over the
//! [`server`] and [`local`] modules.

pub use crate::config::Config;
pub use crate::context::ServiceContext;
pub use crate::crypto::{Cipher, CipherKind};
pub use crate::relay::address::Address;
pub use crate::server::Server;

pub mod acl;
pub mod buffer;
pub mod config;
pub mod context;
pub mod crypto;
pub mod local;
pub mod lru;
pub mod rate;
pub mod relay;
pub mod server;
pub mod stats;
pub mod users;

/// Crate version, printed by the binaries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
