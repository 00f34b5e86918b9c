//! NAT table for reply routing
//!
//! Each client source address gets a dedicated upstream socket bound on an
//! ephemeral port. The reply pump task owns its entry: it is the only
//! reader of the upstream socket and removes the entry when it exits, so
//! the table shrinks back to empty once traffic stops.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;
use tokio::net::UdpSocket;
use tokio::time;

pub struct NatEntry {
    socket: UdpSocket,
    /// absolute expiry, pushed forward by every inbound packet and every
    /// pump read
    deadline: Mutex<Instant>,
}

impl NatEntry {
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Send through the dual-stack socket. IPv4 destinations go out as
    /// v4-mapped IPv6 addresses, which is what the wildcard `[::]` bind
    /// requires.
    pub async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        let dest = match dest {
            SocketAddr::V4(v4) => SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port()),
            v6 => v6,
        };
        self.socket.send_to(buf, dest).await
    }

    /// Push the idle deadline forward
    pub fn refresh(&self, timeout: Duration) {
        let mut deadline = self.deadline.lock().expect("nat deadline poisoned");
        *deadline = Instant::now() + timeout;
    }

    fn deadline(&self) -> Instant {
        *self.deadline.lock().expect("nat deadline poisoned")
    }

    /// Receive from the upstream socket until the idle deadline passes.
    /// Returns `None` on expiry. A refresh from the inbound path while
    /// this read is blocked extends the wait: the deadline is re-checked
    /// after every timer fire. Sources arriving as v4-mapped IPv6 come
    /// back as plain IPv4.
    pub async fn recv_until_deadline(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        loop {
            let now = Instant::now();
            let deadline = self.deadline();
            if now >= deadline {
                return Ok(None);
            }

            match time::timeout(deadline - now, self.socket.recv_from(buf)).await {
                Ok(result) => return result.map(|(n, addr)| Some((n, canonical_addr(addr)))),
                Err(_elapsed) => continue,
            }
        }
    }
}

fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        v4 => v4,
    }
}

pub struct NatMap {
    conns: Mutex<HashMap<String, Arc<NatEntry>>>,
}

impl NatMap {
    pub fn new() -> Arc<NatMap> {
        Arc::new(NatMap {
            conns: Mutex::new(HashMap::new()),
        })
    }

    /// Existing entry for `source`, or a freshly bound one. The bool is
    /// true when this call created the entry (and a reply pump must be
    /// spawned for it).
    pub async fn get_or_create(&self, source: &str, timeout: Duration) -> io::Result<(Arc<NatEntry>, bool)> {
        if let Some(entry) = self.get(source) {
            return Ok((entry, false));
        }

        // dual-stack wildcard bind on an ephemeral port
        let socket = UdpSocket::bind("[::]:0").await?;
        debug!("nat entry for {} bound on {}", source, socket.local_addr()?);

        let entry = Arc::new(NatEntry {
            socket,
            deadline: Mutex::new(Instant::now() + timeout),
        });

        let mut conns = self.conns.lock().expect("nat map poisoned");
        // lost a race with a concurrent packet from the same source
        if let Some(existing) = conns.get(source) {
            return Ok((existing.clone(), false));
        }
        conns.insert(source.to_owned(), entry.clone());
        Ok((entry, true))
    }

    pub fn get(&self, source: &str) -> Option<Arc<NatEntry>> {
        let conns = self.conns.lock().expect("nat map poisoned");
        conns.get(source).cloned()
    }

    /// Drop the entry; the socket closes once the owning pump lets go of
    /// its reference
    pub fn remove(&self, source: &str) {
        let mut conns = self.conns.lock().expect("nat map poisoned");
        if conns.remove(source).is_some() {
            debug!("nat entry for {source} removed");
        }
    }

    pub fn len(&self) -> usize {
        self.conns.lock().expect("nat map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
