//! Shared state of a running engine
//!
//! Owns the process-wide caches and services: the per-user cipher cache,
//! the per-user token buckets, the statistics service and the provider
//! seams. Created once at startup and handed around by `Arc`; tests build
//! isolated contexts of their own.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::debug;

use crate::acl::HostBlockList;
use crate::buffer::BufferPool;
use crate::crypto::{Cipher, CipherKind};
use crate::lru::LruCache;
use crate::rate::{Bucket, BUCKET_BURST};
use crate::stats::StatsService;
use crate::users::{CredentialProvider, LicenseProvider, UserCredential};

/// Entries per user-keyed cache
pub const CACHE_CAPACITY: usize = 10_000;

struct Timeouts {
    read: Duration,
    udp: Duration,
}

pub struct ServiceContext {
    method: CipherKind,
    auth: bool,
    timeouts: RwLock<Timeouts>,
    cipher_cache: Mutex<LruCache<Cipher>>,
    read_buckets: Mutex<LruCache<Arc<Bucket>>>,
    write_buckets: Mutex<LruCache<Arc<Bucket>>>,
    stats: StatsService,
    credentials: Arc<dyn CredentialProvider>,
    license: Arc<dyn LicenseProvider>,
    block_list: Option<HostBlockList>,
    buffer_pool: Arc<BufferPool>,
}

impl ServiceContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        method: CipherKind,
        auth: bool,
        read_timeout: Duration,
        udp_timeout: Duration,
        stats: StatsService,
        credentials: Arc<dyn CredentialProvider>,
        license: Arc<dyn LicenseProvider>,
        block_list: Option<HostBlockList>,
    ) -> Arc<ServiceContext> {
        Arc::new(ServiceContext {
            method,
            auth,
            timeouts: RwLock::new(Timeouts {
                read: read_timeout,
                udp: udp_timeout,
            }),
            cipher_cache: Mutex::new(LruCache::new(CACHE_CAPACITY, None)),
            read_buckets: Mutex::new(LruCache::new(CACHE_CAPACITY, None)),
            write_buckets: Mutex::new(LruCache::new(CACHE_CAPACITY, None)),
            stats,
            credentials,
            license,
            block_list,
            buffer_pool: BufferPool::for_udp(),
        })
    }

    pub fn method(&self) -> CipherKind {
        self.method
    }

    /// Global one-time-auth requirement from configuration
    pub fn auth(&self) -> bool {
        self.auth
    }

    pub fn read_timeout(&self) -> Duration {
        self.timeouts.read().expect("timeouts poisoned").read
    }

    pub fn udp_timeout(&self) -> Duration {
        self.timeouts.read().expect("timeouts poisoned").udp
    }

    /// Swap timeouts in place; used by configuration reload
    pub fn set_timeouts(&self, read: Duration, udp: Duration) {
        let mut timeouts = self.timeouts.write().expect("timeouts poisoned");
        timeouts.read = read;
        timeouts.udp = udp;
    }

    pub fn stats(&self) -> &StatsService {
        &self.stats
    }

    pub fn lookup_user(&self, user_id: u32) -> Option<UserCredential> {
        self.credentials.lookup(user_id)
    }

    pub fn license(&self) -> &dyn LicenseProvider {
        &*self.license
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    /// Whether the decoded destination host is blocked
    pub fn is_host_blocked(&self, host: &str) -> bool {
        match self.block_list {
            Some(ref list) => list.contains(host),
            None => false,
        }
    }

    /// A fresh cipher instance for the user, key material cached so the
    /// password is stretched once per user rather than per connection.
    /// Eviction drops the cached instance, which zeroes its key.
    pub fn cipher_for_user(&self, user_id: u32, password: &str) -> Cipher {
        let mut cache = self.cipher_cache.lock().expect("cipher cache poisoned");
        if let Some(cipher) = cache.get(user_id) {
            return cipher.duplicate();
        }

        debug!("creating cipher for user {user_id}");
        let cipher = Cipher::from_method(self.method, password);
        let duplicate = cipher.duplicate();
        cache.add(user_id, cipher);
        duplicate
    }

    pub fn read_bucket_for_user(&self, user_id: u32, bandwidth_mbps: i64) -> Option<Arc<Bucket>> {
        Self::bucket_for_user(&self.read_buckets, user_id, bandwidth_mbps)
    }

    pub fn write_bucket_for_user(&self, user_id: u32, bandwidth_mbps: i64) -> Option<Arc<Bucket>> {
        Self::bucket_for_user(&self.write_buckets, user_id, bandwidth_mbps)
    }

    /// Per-user pacing bucket; non-positive bandwidth means unlimited.
    /// A live bucket is re-rated in place when the credential changed.
    fn bucket_for_user(
        cache: &Mutex<LruCache<Arc<Bucket>>>,
        user_id: u32,
        bandwidth_mbps: i64,
    ) -> Option<Arc<Bucket>> {
        if bandwidth_mbps <= 0 {
            return None;
        }

        let rate = (bandwidth_mbps * 1_000_000 / 8) as f64;
        let mut cache = cache.lock().expect("bucket cache poisoned");
        if let Some(bucket) = cache.get(user_id) {
            if bucket.origin_rate() != bandwidth_mbps {
                bucket.update_rate(rate, bandwidth_mbps);
            }
            return Some(bucket.clone());
        }

        let bucket = Arc::new(Bucket::new(rate, BUCKET_BURST, bandwidth_mbps));
        cache.add(user_id, bucket.clone());
        Some(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::{LicenseLimit, MemoryCredentials, StaticLicense};
    use std::collections::HashMap;

    fn test_context() -> Arc<ServiceContext> {
        let (stats, _) = StatsService::spawn();
        ServiceContext::new(
            CipherKind::Aes256Cfb,
            false,
            Duration::from_secs(60),
            Duration::from_secs(60),
            stats,
            Arc::new(MemoryCredentials::from_map(HashMap::new())),
            Arc::new(StaticLicense(LicenseLimit::unlimited())),
            None,
        )
    }

    #[tokio::test]
    async fn cipher_cache_returns_same_key() {
        let context = test_context();
        let a = context.cipher_for_user(7, "pwd");
        let b = context.cipher_for_user(7, "pwd");
        assert_eq!(a.key(), b.key());
        assert_eq!(context.cipher_cache.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn buckets_are_shared_and_rerated() {
        let context = test_context();
        assert!(context.read_bucket_for_user(7, -1).is_none());
        assert!(context.read_bucket_for_user(7, 0).is_none());

        let a = context.read_bucket_for_user(7, 1).unwrap();
        let b = context.read_bucket_for_user(7, 1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = context.read_bucket_for_user(7, 10).unwrap();
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(a.origin_rate(), 10);
    }
}
