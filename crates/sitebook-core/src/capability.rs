//! Identity & capability gate
//!
//! `capability(user, module, action)` is the single authority consulted by
//! every mutating operation and every read that can surface financials.
//! Role rows live in the database; a short-lived per-user cache (60s TTL)
//! keeps the hot path off the store. Admins carry a `*`/`*` grant.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::Role;

const CACHE_TTL: Duration = Duration::from_secs(60);
const CACHE_CAP: usize = 500;

struct CachedCaps {
    role: Role,
    caps: HashSet<(String, String)>,
    fetched_at: Instant,
}

pub struct CapabilityGate {
    db: Database,
    cache: Mutex<HashMap<Uuid, CachedCaps>>,
}

impl CapabilityGate {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the user's role grants (module, action). Unknown users have
    /// no capabilities.
    pub fn capability(&self, user: Uuid, module: &str, action: &str) -> Result<bool> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&user) {
                if entry.fetched_at.elapsed() < CACHE_TTL {
                    return Ok(Self::check(&entry.caps, module, action));
                }
            }
        }

        let Some(record) = self.db.get_user(user)? else {
            return Ok(false);
        };
        let caps: HashSet<(String, String)> = self
            .db
            .role_capabilities(record.role)?
            .into_iter()
            .collect();
        let allowed = Self::check(&caps, module, action);

        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= CACHE_CAP {
            // TTL sweep; the cache is small enough that this is rare.
            cache.retain(|_, v| v.fetched_at.elapsed() < CACHE_TTL);
        }
        cache.insert(
            user,
            CachedCaps {
                role: record.role,
                caps,
                fetched_at: Instant::now(),
            },
        );
        Ok(allowed)
    }

    /// Capability check that errors with `unauthorized` on denial.
    pub fn require(&self, user: Uuid, module: &str, action: &str) -> Result<()> {
        if self.capability(user, module, action)? {
            Ok(())
        } else {
            Err(Error::Unauthorized(format!(
                "Missing capability {}:{}",
                module, action
            )))
        }
    }

    /// The user's role, from the same cache.
    pub fn role(&self, user: Uuid) -> Result<Role> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&user) {
                if entry.fetched_at.elapsed() < CACHE_TTL {
                    return Ok(entry.role);
                }
            }
        }
        // capability() refreshes the cache as a side effect
        self.capability(user, "expenses", "read")?;
        let cache = self.cache.lock().unwrap();
        cache
            .get(&user)
            .map(|e| e.role)
            .ok_or_else(|| Error::Unauthenticated(format!("Unknown user {}", user)))
    }

    fn check(caps: &HashSet<(String, String)>, module: &str, action: &str) -> bool {
        caps.contains(&(module.to_string(), action.to_string()))
            || caps.contains(&("*".to_string(), "*".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_allows_and_denies_by_role() {
        let db = Database::in_memory().unwrap();
        db.seed_default_capabilities().unwrap();
        let gate = CapabilityGate::new(db.clone());

        let bookkeeper = db
            .create_user("bk@example.com", "BK", Role::Bookkeeper, None)
            .unwrap();
        let admin = db
            .create_user("admin@example.com", "Admin", Role::Admin, None)
            .unwrap();

        assert!(gate.capability(bookkeeper, "expenses", "update").unwrap());
        assert!(!gate.capability(bookkeeper, "expenses", "delete").unwrap());
        assert!(!gate.capability(bookkeeper, "autoauth", "run").unwrap());
        // wildcard grant
        assert!(gate.capability(admin, "expenses", "delete").unwrap());
        assert!(gate.capability(admin, "anything", "whatever").unwrap());
        // unknown user
        assert!(!gate.capability(Uuid::new_v4(), "expenses", "read").unwrap());
    }

    #[test]
    fn test_require_errors_unauthorized() {
        let db = Database::in_memory().unwrap();
        db.seed_default_capabilities().unwrap();
        let gate = CapabilityGate::new(db.clone());
        let bookkeeper = db
            .create_user("bk@example.com", "BK", Role::Bookkeeper, None)
            .unwrap();

        let err = gate.require(bookkeeper, "autoauth", "run").unwrap_err();
        assert_eq!(err.kind(), "unauthorized");
        gate.require(bookkeeper, "receipts", "upload").unwrap();
    }

    #[test]
    fn test_cache_serves_repeat_lookups() {
        let db = Database::in_memory().unwrap();
        db.seed_default_capabilities().unwrap();
        let gate = CapabilityGate::new(db.clone());
        let user = db
            .create_user("bk@example.com", "BK", Role::Bookkeeper, None)
            .unwrap();

        assert!(gate.capability(user, "expenses", "read").unwrap());
        assert_eq!(gate.role(user).unwrap(), Role::Bookkeeper);
        // cached entry answers without a fresh row (same result)
        assert!(gate.capability(user, "expenses", "read").unwrap());
    }
}
