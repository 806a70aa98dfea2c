use std::sync::Arc;

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::authz::{AuthorizationGate, CacheConfig, PermissionAdmin, PermissionCache, PermissionResolver};
use crate::errors::AppError;
use crate::jwt::JwtConfig;
use crate::routes::{authz, departments, health, permissions};
use crate::stores::DepartmentStore;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub jwt: Arc<JwtConfig>,
    pub gate: AuthorizationGate,
    pub admin: PermissionAdmin,
    pub departments: DepartmentStore,
}

impl AppState {
    pub fn new(pool: SqlitePool, jwt: JwtConfig, cache: Arc<PermissionCache>) -> Self {
        Self {
            gate: AuthorizationGate::new(PermissionResolver::new(pool.clone()), Arc::clone(&cache)),
            admin: PermissionAdmin::new(pool.clone(), cache),
            departments: DepartmentStore::new(pool.clone()),
            jwt: Arc::new(jwt),
            pool,
        }
    }
}

pub async fn create_app(pool: SqlitePool) -> Result<Router, AppError> {
    let jwt_config = JwtConfig::from_env()?;
    let cache_config = CacheConfig::from_env()?;
    let cache = Arc::new(PermissionCache::from_config(&cache_config));

    tracing::info!(
        enabled = cache_config.enabled,
        ttl_secs = cache_config.ttl.as_secs(),
        capacity = cache_config.max_capacity,
        "permission cache configured"
    );

    Ok(create_app_with(pool, jwt_config, cache))
}

/// Router over explicit configuration; used by `create_app` and by tests.
pub fn create_app_with(pool: SqlitePool, jwt: JwtConfig, cache: Arc<PermissionCache>) -> Router {
    let state = AppState::new(pool, jwt, cache);

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health::health))
        .nest("/authz", authz::routes())
        .nest("/departments", departments::routes())
        .nest("/permissions", permissions::routes())
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
