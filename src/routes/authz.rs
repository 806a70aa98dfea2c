//! Self-service permission queries for the logged-in user.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use crate::app::AppState;
use crate::errors::AppError;
use crate::jwt::AuthUser;
use crate::models::permission::{CheckResponse, EffectivePermissions};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/me/permissions", get(my_permissions))
        .route("/check/:code", get(check_permission))
}

/// Effective page codes of the caller
#[utoipa::path(
    get,
    path = "/authz/me/permissions",
    tag = "Authz",
    responses(
        (status = 200, description = "Effective permission set", body = EffectivePermissions),
        (status = 401, description = "Missing or invalid token"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn my_permissions(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<EffectivePermissions>, AppError> {
    let principal = auth.principal;
    let codes = state.gate.effective_permissions(&principal).await?;

    Ok(Json(EffectivePermissions {
        user_id: principal.user_id,
        role: principal.role,
        department_id: principal.department_id,
        permissions: codes.into_iter().collect(),
    }))
}

/// Whether the caller may use a page code
#[utoipa::path(
    get,
    path = "/authz/check/{code}",
    tag = "Authz",
    params(("code" = String, Path, description = "Page code, e.g. contacts.delete")),
    responses(
        (status = 200, description = "Decision", body = CheckResponse),
    ),
    security(("bearerAuth" = []))
)]
pub async fn check_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(code): Path<String>,
) -> Result<Json<CheckResponse>, AppError> {
    let decision = state.gate.authorize(&auth.principal, &code).await?;

    Ok(Json(CheckResponse {
        allowed: decision.is_allowed(),
        code,
    }))
}
