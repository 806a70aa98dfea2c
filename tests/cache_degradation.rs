mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crm_authz::authz::{
    Actor, AuthorizationGate, CacheBackend, CacheError, Decision, PermissionAdmin, PermissionCache,
    PermissionResolver, Principal, UpdateTargetPermissions,
};
use crm_authz::models::audit::RequestContext;
use crm_authz::models::permission::TargetRef;
use crm_authz::models::user::Role;

use common::{codes, create_department, insert_user, setup};

/// Cache server that refuses every call.
#[derive(Default)]
struct Unreachable {
    calls: AtomicUsize,
}

impl Unreachable {
    fn fail<T>(&self) -> Result<T, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Unavailable("connection refused".into()))
    }
}

#[async_trait]
impl CacheBackend for Unreachable {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        self.fail()
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        self.fail()
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.fail()
    }
}

/// Backend holding garbage for every key.
struct Garbage;

#[async_trait]
impl CacheBackend for Garbage {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Ok(Some("{not json".into()))
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

async fn granted_dashboard(pool: &sqlx::SqlitePool, cache: Arc<PermissionCache>) -> Result<(Principal, AuthorizationGate)> {
    let sales = create_department(pool, "Sales", None).await?;
    let user_id = insert_user(pool, "alice", "user", Some(sales)).await?;

    PermissionAdmin::new(pool.clone(), Arc::clone(&cache))
        .update_target_permissions(UpdateTargetPermissions {
            target: TargetRef::Department(sales),
            codes: codes(&["dashboard"]),
            actor: Actor::new(1, "root"),
            context: RequestContext::new(),
        })
        .await?;

    let gate = AuthorizationGate::new(PermissionResolver::new(pool.clone()), cache);
    Ok((Principal::new(user_id, Role::User, Some(sales)), gate))
}

#[tokio::test]
async fn unreachable_cache_still_resolves_from_the_database() -> Result<()> {
    let (_dir, pool) = setup().await?;
    let backend = Arc::new(Unreachable::default());
    let cache = Arc::new(PermissionCache::new(backend.clone(), Duration::from_secs(3600)));
    let (alice, gate) = granted_dashboard(&pool, cache).await?;

    assert_eq!(gate.authorize(&alice, "dashboard").await?, Decision::Allow);
    assert_eq!(
        gate.authorize(&alice, "customers").await?,
        Decision::Deny { code: "customers".into() }
    );
    assert!(backend.calls.load(Ordering::SeqCst) > 0);

    Ok(())
}

#[tokio::test]
async fn corrupt_entries_are_treated_as_misses() -> Result<()> {
    let (_dir, pool) = setup().await?;
    let cache = Arc::new(PermissionCache::new(Arc::new(Garbage), Duration::from_secs(3600)));
    let (alice, gate) = granted_dashboard(&pool, cache).await?;

    assert_eq!(gate.effective_permissions(&alice).await?, codes(&["dashboard"]));

    Ok(())
}

#[tokio::test]
async fn disabled_cache_always_resolves_live() -> Result<()> {
    let (_dir, pool) = setup().await?;
    let cache = Arc::new(PermissionCache::disabled());
    let (alice, gate) = granted_dashboard(&pool, Arc::clone(&cache)).await?;

    assert!(gate.require(&alice, "dashboard").await.is_ok());
    assert!(cache.get(&alice).await.is_none());

    // rows changed behind the engine's back are visible immediately
    sqlx::query("DELETE FROM permission_overrides").execute(&pool).await?;
    assert!(gate.require(&alice, "dashboard").await.is_err());

    Ok(())
}
