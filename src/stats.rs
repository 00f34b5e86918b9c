//! Per-user traffic statistics
//!
//! All counter updates flow through a bounded queue into a single worker
//! task that owns the map. The fast path is one enqueue; a full queue
//! blocks the sender, which is the intended back-pressure signal. Counters
//! only ever grow.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const STATS_QUEUE_CAPACITY: usize = 100;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UserStatistic {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connections: u64,
}

enum Op {
    IncConnections(u32),
    IncBytesIn(u32, u64),
    IncBytesOut(u32, u64),
    Snapshot(oneshot::Sender<HashMap<u32, UserStatistic>>),
}

/// Handle to the statistics worker; cheap to clone, one per engine.
#[derive(Clone)]
pub struct StatsService {
    tx: mpsc::Sender<Op>,
}

impl StatsService {
    /// Spawn the worker and return a handle to it. The worker runs until
    /// every handle is dropped.
    pub fn spawn() -> (StatsService, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(STATS_QUEUE_CAPACITY);

        let handle = tokio::spawn(async move {
            let mut users: HashMap<u32, UserStatistic> = HashMap::new();
            while let Some(op) = rx.recv().await {
                match op {
                    Op::IncConnections(user_id) => {
                        users.entry(user_id).or_default().connections += 1;
                    }
                    Op::IncBytesIn(user_id, n) => {
                        users.entry(user_id).or_default().bytes_in += n;
                    }
                    Op::IncBytesOut(user_id, n) => {
                        users.entry(user_id).or_default().bytes_out += n;
                    }
                    Op::Snapshot(reply) => {
                        let _ = reply.send(users.clone());
                    }
                }
            }
        });

        (StatsService { tx }, handle)
    }

    pub async fn inc_connections(&self, user_id: u32) {
        let _ = self.tx.send(Op::IncConnections(user_id)).await;
    }

    pub async fn inc_bytes_in(&self, user_id: u32, n: u64) {
        let _ = self.tx.send(Op::IncBytesIn(user_id, n)).await;
    }

    pub async fn inc_bytes_out(&self, user_id: u32, n: u64) {
        let _ = self.tx.send(Op::IncBytesOut(user_id, n)).await;
    }

    /// Current counters for every user seen so far. This is the map the
    /// statistics endpoint publishes, keyed by user id.
    pub async fn snapshot(&self) -> HashMap<u32, UserStatistic> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Op::Snapshot(reply_tx)).await.is_err() {
            return HashMap::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}
