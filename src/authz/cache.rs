//! Write-through cache of resolved permission sets, keyed by user.
//!
//! The cache is a disposable view of the override tables. Backend failures are logged and
//! treated as misses; correctness comes from explicit invalidation after every committed write,
//! the TTL is only a safety net.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};

use super::Principal;
use crate::errors::AppError;
use crate::models::user::Role;
use crate::stores::DepartmentStore;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_CAPACITY: u64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
}

/// Key/value store with per-entry TTL behind the permission cache.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn clear(&self) -> Result<(), CacheError>;
}

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    pub max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: DEFAULT_TTL,
            max_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();

        let enabled = match std::env::var("PERMISSION_CACHE_ENABLED") {
            Ok(value) => match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(AppError::configuration("PERMISSION_CACHE_ENABLED must be a boolean")),
            },
            Err(_) => defaults.enabled,
        };

        let ttl = std::env::var("PERMISSION_CACHE_TTL_SECS")
            .map(|val| val.parse::<u64>().map(Duration::from_secs))
            .unwrap_or(Ok(defaults.ttl))
            .map_err(|_| AppError::configuration("PERMISSION_CACHE_TTL_SECS must be a valid integer"))?;

        let max_capacity = std::env::var("PERMISSION_CACHE_CAPACITY")
            .map(|val| val.parse::<u64>())
            .unwrap_or(Ok(defaults.max_capacity))
            .map_err(|_| AppError::configuration("PERMISSION_CACHE_CAPACITY must be a valid integer"))?;

        Ok(Self { enabled, ttl, max_capacity })
    }
}

// =============================================================================
// MOKA BACKEND
// =============================================================================

#[derive(Debug, Clone)]
struct TtlValue {
    value: String,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, TtlValue> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &TtlValue, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &TtlValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process backend built on moka's async cache.
pub struct MokaBackend {
    cache: Cache<String, TtlValue>,
}

impl MokaBackend {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }
}

#[async_trait]
impl CacheBackend for MokaBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.cache.get(key).await.map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.cache.insert(key.to_string(), TtlValue { value, ttl }).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.cache.invalidate_all();
        Ok(())
    }
}

// =============================================================================
// PERMISSION CACHE
// =============================================================================

/// Stored value. Role and department are kept so a changed identity triple misses.
#[derive(Debug, Serialize, Deserialize)]
struct CachedPermissions {
    role: Role,
    department_id: Option<i64>,
    codes: BTreeSet<String>,
}

/// Snapshot of the invalidation generation taken before a resolution starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTicket(u64);

pub struct PermissionCache {
    backend: Option<Arc<dyn CacheBackend>>,
    ttl: Duration,
    generation: AtomicU64,
}

impl std::fmt::Debug for PermissionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionCache")
            .field("enabled", &self.backend.is_some())
            .field("ttl", &self.ttl)
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}

impl PermissionCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            backend: Some(backend),
            ttl,
            generation: AtomicU64::new(0),
        }
    }

    /// Every lookup misses and every write is dropped.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            ttl: DEFAULT_TTL,
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        if config.enabled {
            Self::new(Arc::new(MokaBackend::new(config.max_capacity)), config.ttl)
        } else {
            tracing::warn!("permission cache disabled; every check resolves from the database");
            Self::disabled()
        }
    }

    pub fn key(user_id: i64) -> String {
        format!("user:permissions:{user_id}")
    }

    pub fn ticket(&self) -> CacheTicket {
        CacheTicket(self.generation.load(Ordering::SeqCst))
    }

    /// Cached set for `principal`, or `None` on a miss, a backend failure, a corrupt entry or an
    /// entry recorded for a different role/department.
    pub async fn get(&self, principal: &Principal) -> Option<BTreeSet<String>> {
        let backend = self.backend.as_ref()?;
        if principal.is_super_admin() {
            return None;
        }

        let key = Self::key(principal.user_id);
        let raw = match backend.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(user_id = principal.user_id, error = %err, "permission cache read failed, resolving live");
                return None;
            }
        };

        let cached: CachedPermissions = match serde_json::from_str(&raw) {
            Ok(cached) => cached,
            Err(err) => {
                let err = CacheError::Corrupt(err.to_string());
                tracing::warn!(user_id = principal.user_id, error = %err, "dropping unreadable cache entry");
                self.delete(&key).await;
                return None;
            }
        };

        if cached.role != principal.role || cached.department_id != principal.department_id {
            tracing::debug!(user_id = principal.user_id, "cached permissions belong to a stale identity");
            return None;
        }

        Some(cached.codes)
    }

    /// Stores a resolution unless an invalidation happened since `ticket` was taken.
    /// Returns whether the entry was kept.
    pub async fn put(&self, ticket: CacheTicket, principal: &Principal, codes: &BTreeSet<String>) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        if principal.is_super_admin() || self.ticket() != ticket {
            return false;
        }

        let value = CachedPermissions {
            role: principal.role,
            department_id: principal.department_id,
            codes: codes.clone(),
        };
        let raw = match serde_json::to_string(&value) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(user_id = principal.user_id, error = %err, "failed to serialize permissions for cache");
                return false;
            }
        };

        let key = Self::key(principal.user_id);
        if let Err(err) = backend.set(&key, raw, self.ttl).await {
            tracing::warn!(user_id = principal.user_id, error = %err, "permission cache write failed");
            return false;
        }

        // an invalidation that raced the write may have run before it landed
        if self.ticket() != ticket {
            self.delete(&key).await;
            return false;
        }

        true
    }

    pub async fn invalidate_user(&self, user_id: i64) {
        self.bump();
        self.delete(&Self::key(user_id)).await;
        tracing::debug!(user_id, "permission cache invalidated for user");
    }

    pub async fn invalidate_users(&self, user_ids: &[i64]) {
        self.bump();
        for &user_id in user_ids {
            self.delete(&Self::key(user_id)).await;
        }
    }

    /// Invalidates every member of the department and of all its sub-departments. Clears the
    /// whole cache when members cannot be enumerated.
    pub async fn invalidate_department(&self, department_id: i64, departments: &DepartmentStore) -> usize {
        if self.backend.is_none() {
            return 0;
        }

        match departments.affected_user_ids(department_id).await {
            Ok(user_ids) => {
                self.invalidate_users(&user_ids).await;
                tracing::info!(department_id, users = user_ids.len(), "permission cache invalidated for department");
                user_ids.len()
            }
            Err(err) => {
                tracing::warn!(department_id, error = %err, "could not enumerate department members, clearing permission cache");
                self.clear().await;
                0
            }
        }
    }

    pub async fn clear(&self) {
        self.bump();
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        if let Err(err) = backend.clear().await {
            tracing::error!(error = %err, "failed to clear permission cache");
        }
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    async fn delete(&self, key: &str) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        if let Err(err) = backend.delete(key).await {
            tracing::error!(key = %key, error = %err, "permission cache delete failed, entry may stay stale until TTL");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend whose every call fails, standing in for an unreachable cache server.
    struct DownBackend;

    #[async_trait]
    impl CacheBackend for DownBackend {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn clear(&self) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    fn user(id: i64, department_id: Option<i64>) -> Principal {
        Principal::new(id, Role::User, department_id)
    }

    fn codes(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    fn moka_cache() -> PermissionCache {
        PermissionCache::new(Arc::new(MokaBackend::new(100)), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn put_then_get_hits() {
        let cache = moka_cache();
        let alice = user(42, Some(5));

        assert!(cache.get(&alice).await.is_none());
        assert!(cache.put(cache.ticket(), &alice, &codes(&["dashboard"])).await);
        assert_eq!(cache.get(&alice).await, Some(codes(&["dashboard"])));
    }

    #[tokio::test]
    async fn invalidated_entry_misses() {
        let cache = moka_cache();
        let alice = user(42, Some(5));

        cache.put(cache.ticket(), &alice, &codes(&["dashboard"])).await;
        cache.invalidate_user(42).await;
        assert!(cache.get(&alice).await.is_none());
    }

    #[tokio::test]
    async fn put_with_stale_ticket_is_dropped() {
        let cache = moka_cache();
        let alice = user(42, Some(5));

        let ticket = cache.ticket();
        cache.invalidate_user(7).await;

        assert!(!cache.put(ticket, &alice, &codes(&["dashboard"])).await);
        assert!(cache.get(&alice).await.is_none());
    }

    #[tokio::test]
    async fn changed_department_misses() {
        let cache = moka_cache();

        cache.put(cache.ticket(), &user(42, Some(5)), &codes(&["dashboard"])).await;
        assert!(cache.get(&user(42, Some(6))).await.is_none());
    }

    #[tokio::test]
    async fn super_admin_is_never_cached() {
        let cache = moka_cache();
        let root = Principal::new(1, Role::SuperAdmin, None);

        assert!(!cache.put(cache.ticket(), &root, &codes(&["dashboard"])).await);
        assert!(cache.get(&root).await.is_none());
    }

    #[tokio::test]
    async fn backend_failures_degrade_to_misses() {
        let cache = PermissionCache::new(Arc::new(DownBackend), Duration::from_secs(60));
        let alice = user(42, Some(5));

        assert!(!cache.put(cache.ticket(), &alice, &codes(&["dashboard"])).await);
        assert!(cache.get(&alice).await.is_none());
        cache.invalidate_user(42).await;
        cache.clear().await;
    }

    #[tokio::test]
    async fn expired_entries_miss() {
        let cache = PermissionCache::new(Arc::new(MokaBackend::new(100)), Duration::from_millis(50));
        let alice = user(42, Some(5));

        cache.put(cache.ticket(), &alice, &codes(&["dashboard"])).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.get(&alice).await.is_none());
    }

    #[test]
    fn config_defaults_to_one_hour() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.ttl, Duration::from_secs(3600));
    }
}
