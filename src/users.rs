//! Credential and license provider seams
//!
//! The engine only consumes these interfaces. The in-memory credential
//! store backs the `user_password` configuration block and is hot-swapped
//! on reload; a SQL- or cache-backed store implements the same trait out
//! of crate.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

/// One user's secret and bandwidth allowance. A non-positive bandwidth
/// means unlimited.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserCredential {
    pub password: String,
    pub bandwidth_mbps: i64,
}

pub trait CredentialProvider: Send + Sync {
    fn lookup(&self, user_id: u32) -> Option<UserCredential>;
}

/// Credentials held in memory, replaceable as a whole for configuration
/// reloads without disturbing live connections
#[derive(Default)]
pub struct MemoryCredentials {
    users: RwLock<HashMap<u32, UserCredential>>,
}

impl MemoryCredentials {
    pub fn from_map(users: HashMap<u32, UserCredential>) -> MemoryCredentials {
        MemoryCredentials {
            users: RwLock::new(users),
        }
    }

    pub fn replace(&self, users: HashMap<u32, UserCredential>) {
        let mut guard = self.users.write().expect("credential store poisoned");
        *guard = users;
    }

    pub fn len(&self) -> usize {
        self.users.read().expect("credential store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CredentialProvider for MemoryCredentials {
    fn lookup(&self, user_id: u32) -> Option<UserCredential> {
        let users = self.users.read().expect("credential store poisoned");
        users.get(&user_id).cloned()
    }
}

/// Deployment limits the engine must respect
#[derive(Clone, Debug)]
pub struct LicenseLimit {
    pub expire_at: Option<SystemTime>,
    pub max_users: i64,
    pub max_servers: i64,
    /// per-user bandwidth ceiling in Mbps; non-positive means uncapped
    pub max_bandwidth_mbps: i64,
}

impl LicenseLimit {
    pub fn unlimited() -> LicenseLimit {
        LicenseLimit {
            expire_at: None,
            max_users: 0,
            max_servers: 0,
            max_bandwidth_mbps: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expire_at {
            Some(t) => SystemTime::now() > t,
            None => false,
        }
    }

    /// Cap a user's configured bandwidth by the license ceiling
    pub fn cap_bandwidth(&self, bandwidth_mbps: i64) -> i64 {
        if self.max_bandwidth_mbps > 0 && bandwidth_mbps > self.max_bandwidth_mbps {
            self.max_bandwidth_mbps
        } else {
            bandwidth_mbps
        }
    }
}

pub trait LicenseProvider: Send + Sync {
    fn limit(&self) -> LicenseLimit;
}

/// Fixed license, used when no external verifier is wired in
pub struct StaticLicense(pub LicenseLimit);

impl LicenseProvider for StaticLicense {
    fn limit(&self) -> LicenseLimit {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn lookup_and_replace() {
        let creds = MemoryCredentials::from_map(HashMap::from([(
            7,
            UserCredential {
                password: "pwd".to_owned(),
                bandwidth_mbps: -1,
            },
        )]));

        assert_eq!(creds.lookup(7).unwrap().password, "pwd");
        assert!(creds.lookup(8).is_none());

        creds.replace(HashMap::from([(
            8,
            UserCredential {
                password: "new".to_owned(),
                bandwidth_mbps: 10,
            },
        )]));
        assert!(creds.lookup(7).is_none());
        assert_eq!(creds.lookup(8).unwrap().bandwidth_mbps, 10);
    }

    #[test]
    fn license_expiry_and_capping() {
        let valid = LicenseLimit::unlimited();
        assert!(!valid.is_expired());
        assert_eq!(valid.cap_bandwidth(1000), 1000);

        let expired = LicenseLimit {
            expire_at: Some(SystemTime::now() - Duration::from_secs(1)),
            max_bandwidth_mbps: 100,
            ..LicenseLimit::unlimited()
        };
        assert!(expired.is_expired());
        assert_eq!(expired.cap_bandwidth(1000), 100);
        // unlimited users stay unlimited, matching the lookup contract
        assert_eq!(expired.cap_bandwidth(-1), -1);
    }
}
