//! Upstream server selection
//!
//! Servers are tried in their configured order. A server that has been
//! failing is skipped with probability `fail_count / (fail_count + 20)`,
//! so a flaky upstream decays out of rotation but keeps getting the
//! occasional probe and recovers on the first success. Servers skipped on
//! the first pass are retried unconditionally before giving up.

use std::io::{self, ErrorKind};
use std::sync::Mutex;

use log::{debug, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;

use crate::crypto::Cipher;
use crate::relay::address::Address;
use crate::relay::tcprelay::ProxyClientStream;

/// Weight added to the fail count in the skip probability denominator
const BASE_FAIL_WEIGHT: u32 = 20;
/// Fail counts saturate here; an upstream is never written off entirely
const MAX_FAIL_COUNT: u32 = 30;

/// One configured upstream: address and the credential-derived cipher
/// all connections to it start from
pub struct ServerCipher {
    pub addr: String,
    cipher: Cipher,
}

impl ServerCipher {
    pub fn new(addr: String, cipher: Cipher) -> ServerCipher {
        ServerCipher { addr, cipher }
    }
}

pub struct Dispatcher {
    servers: Vec<ServerCipher>,
    fail_counts: Mutex<Vec<u32>>,
    rng: Mutex<SmallRng>,
}

impl Dispatcher {
    pub fn new(servers: Vec<ServerCipher>) -> Dispatcher {
        Dispatcher::with_rng(servers, SmallRng::from_entropy())
    }

    /// Deterministic variant for tests
    pub fn with_rng(servers: Vec<ServerCipher>, rng: SmallRng) -> Dispatcher {
        let fail_counts = vec![0; servers.len()];
        Dispatcher {
            servers,
            fail_counts: Mutex::new(fail_counts),
            rng: Mutex::new(rng),
        }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn fail_counts(&self) -> Vec<u32> {
        self.fail_counts.lock().expect("fail counts poisoned").clone()
    }

    fn should_skip(&self, index: usize) -> bool {
        let fail_count = self.fail_counts.lock().expect("fail counts poisoned")[index];
        if fail_count == 0 {
            return false;
        }
        let mut rng = self.rng.lock().expect("dispatcher rng poisoned");
        rng.gen_range(0..fail_count + BASE_FAIL_WEIGHT) < fail_count
    }

    fn mark_success(&self, index: usize) {
        self.fail_counts.lock().expect("fail counts poisoned")[index] = 0;
    }

    fn mark_failure(&self, index: usize) {
        let mut counts = self.fail_counts.lock().expect("fail counts poisoned");
        if counts[index] < MAX_FAIL_COUNT {
            counts[index] += 1;
        }
    }

    /// Establish a relayed TCP connection to `target` through one of the
    /// configured servers.
    pub async fn connect(&self, target: &Address, user_id: u32, ota: bool) -> io::Result<ProxyClientStream> {
        let mut skipped = Vec::new();
        let mut last_err = None;

        for index in 0..self.servers.len() {
            if self.should_skip(index) {
                skipped.push(index);
                continue;
            }
            match self.try_connect(index, target, user_id, ota).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }

        // last resort: probe everything skipped, in order
        for index in skipped {
            match self.try_connect(index, target, user_id, ota).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }

        if self.servers.len() > 1 {
            warn!("failed to connect any configured upstream server");
        }
        Err(last_err.unwrap_or_else(|| io::Error::new(ErrorKind::NotConnected, "no upstream server configured")))
    }

    async fn try_connect(&self, index: usize, target: &Address, user_id: u32, ota: bool) -> io::Result<ProxyClientStream> {
        let server = &self.servers[index];
        match ProxyClientStream::connect(&server.addr, server.cipher.duplicate(), user_id, target, ota).await {
            Ok(stream) => {
                debug!("connected {target} via {}", server.addr);
                self.mark_success(index);
                Ok(stream)
            }
            Err(err) => {
                warn!("upstream {} failed: {err}", server.addr);
                self.mark_failure(index);
                Err(err)
            }
        }
    }

    /// Pick a server for datagram traffic and return a socket connected
    /// to it, with the cipher material to frame packets for it.
    pub async fn connect_udp(&self) -> io::Result<(UdpSocket, Cipher)> {
        let mut skipped = Vec::new();
        let mut last_err = None;

        for index in 0..self.servers.len() {
            if self.should_skip(index) {
                skipped.push(index);
                continue;
            }
            match self.try_connect_udp(index).await {
                Ok(result) => return Ok(result),
                Err(err) => last_err = Some(err),
            }
        }
        for index in skipped {
            match self.try_connect_udp(index).await {
                Ok(result) => return Ok(result),
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err.unwrap_or_else(|| io::Error::new(ErrorKind::NotConnected, "no upstream server configured")))
    }

    async fn try_connect_udp(&self, index: usize) -> io::Result<(UdpSocket, Cipher)> {
        let server = &self.servers[index];
        let attempt = async {
            let server_addr = tokio::net::lookup_host(server.addr.as_str())
                .await?
                .next()
                .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("no address for {}", server.addr)))?;

            let bind_addr = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(bind_addr).await?;
            socket.connect(server_addr).await?;
            Ok::<_, io::Error>(socket)
        };
        match attempt.await {
            Ok(socket) => {
                self.mark_success(index);
                Ok((socket, server.cipher.duplicate()))
            }
            Err(err) => {
                warn!("upstream {} failed: {err}", server.addr);
                self.mark_failure(index);
                Err(err)
            }
        }
    }
}
