//! Permission Admin API Routes
//!
//! Page catalog maintenance, per-target permission sets and the audit trail.
//! Every endpoint is restricted to super_admin.

use std::collections::BTreeSet;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};

use crate::app::AppState;
use crate::authz::UpdateTargetPermissions;
use crate::errors::AppError;
use crate::jwt::AuthUser;
use crate::models::audit::{AuditLogPage, AuditLogQuery, ChainReport, RequestContext};
use crate::models::page::{Page, PageActiveRequest, PageCreateRequest, PageNode};
use crate::models::permission::{
    SeedPermissionsResponse, TargetPermissions, TargetRef, TargetType, UpdateTargetPermissionsRequest,
    UpdateTargetPermissionsResponse,
};

// =============================================================================
// ROUTER
// =============================================================================

pub fn routes() -> Router<AppState> {
    Router::new()
        // Page catalog
        .route("/pages", post(create_page))
        .route("/pages/tree", get(page_tree))
        .route("/pages/:code/ancestors", get(page_ancestors))
        .route("/pages/:code/active", put(set_page_active))
        // Target permission sets
        .route(
            "/target/:target_type/:target_id",
            get(get_target_permissions).put(update_target_permissions),
        )
        .route("/target/:target_type/:target_id/seed", post(seed_target_permissions))
        // Audit trail
        .route("/audit-logs", get(list_audit_logs))
        .route("/audit-logs/verify", get(verify_audit_logs))
}

fn target_from_path(target_type: &str, target_id: i64) -> Result<TargetRef, AppError> {
    let target_type: TargetType = target_type.parse()?;
    Ok(TargetRef::new(target_type, target_id))
}

// =============================================================================
// PAGE CATALOG
// =============================================================================

/// Tree of active pages
#[utoipa::path(
    get,
    path = "/permissions/pages/tree",
    tag = "Permissions",
    responses(
        (status = 200, description = "Page tree", body = Vec<PageNode>),
        (status = 403, description = "Not a super_admin"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn page_tree(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<PageNode>>, AppError> {
    auth.principal.require_super_admin()?;
    Ok(Json(state.admin.page_tree().await?))
}

/// Parent chain of a page, nearest first
#[utoipa::path(
    get,
    path = "/permissions/pages/{code}/ancestors",
    tag = "Permissions",
    params(("code" = String, Path, description = "Page code")),
    responses(
        (status = 200, description = "Parent chain", body = Vec<Page>),
        (status = 404, description = "Page not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn page_ancestors(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(code): Path<String>,
) -> Result<Json<Vec<Page>>, AppError> {
    auth.principal.require_super_admin()?;
    Ok(Json(state.admin.parent_chain(&code).await?))
}

#[utoipa::path(
    post,
    path = "/permissions/pages",
    tag = "Permissions",
    request_body = PageCreateRequest,
    responses(
        (status = 201, description = "Page created", body = Page),
        (status = 404, description = "Parent page not found"),
        (status = 409, description = "Page code already exists"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_page(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<PageCreateRequest>,
) -> Result<(StatusCode, Json<Page>), AppError> {
    auth.principal.require_super_admin()?;
    let page = state.admin.create_page(&req).await?;
    Ok((StatusCode::CREATED, Json(page)))
}

/// Activate or deactivate a page
#[utoipa::path(
    put,
    path = "/permissions/pages/{code}/active",
    tag = "Permissions",
    params(("code" = String, Path, description = "Page code")),
    request_body = PageActiveRequest,
    responses(
        (status = 200, description = "Page updated", body = Page),
        (status = 404, description = "Page not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn set_page_active(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(code): Path<String>,
    Json(req): Json<PageActiveRequest>,
) -> Result<Json<Page>, AppError> {
    auth.principal.require_super_admin()?;
    Ok(Json(state.admin.set_page_active(&code, req.is_active).await?))
}

// =============================================================================
// TARGET PERMISSIONS
// =============================================================================

/// Codes explicitly granted to a department or user
#[utoipa::path(
    get,
    path = "/permissions/target/{target_type}/{target_id}",
    tag = "Permissions",
    params(
        ("target_type" = String, Path, description = "department or user"),
        ("target_id" = i64, Path, description = "Department or user ID"),
    ),
    responses(
        (status = 200, description = "Granted codes", body = TargetPermissions),
        (status = 400, description = "Invalid target type"),
        (status = 404, description = "Target not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn get_target_permissions(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((target_type, target_id)): Path<(String, i64)>,
) -> Result<Json<TargetPermissions>, AppError> {
    auth.principal.require_super_admin()?;
    let target = target_from_path(&target_type, target_id)?;
    Ok(Json(state.admin.target_permissions(target).await?))
}

/// Replace the whole permission set of a department or user
#[utoipa::path(
    put,
    path = "/permissions/target/{target_type}/{target_id}",
    tag = "Permissions",
    params(
        ("target_type" = String, Path, description = "department or user"),
        ("target_id" = i64, Path, description = "Department or user ID"),
    ),
    request_body = UpdateTargetPermissionsRequest,
    responses(
        (status = 200, description = "Permissions replaced", body = UpdateTargetPermissionsResponse),
        (status = 400, description = "Invalid target type or unknown page code"),
        (status = 404, description = "Target not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn update_target_permissions(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((target_type, target_id)): Path<(String, i64)>,
    Json(req): Json<UpdateTargetPermissionsRequest>,
) -> Result<Json<UpdateTargetPermissionsResponse>, AppError> {
    auth.principal.require_super_admin()?;
    let target = target_from_path(&target_type, target_id)?;

    let codes: BTreeSet<String> = req.permissions.into_iter().collect();
    let total = codes.len();

    let diff = state
        .admin
        .update_target_permissions(UpdateTargetPermissions {
            target,
            codes,
            actor: auth.actor(),
            context: RequestContext::from_headers(&headers),
        })
        .await?;

    Ok(Json(UpdateTargetPermissionsResponse {
        added: diff.added,
        removed: diff.removed,
        total,
    }))
}

/// Grant every active page to a newly created target
#[utoipa::path(
    post,
    path = "/permissions/target/{target_type}/{target_id}/seed",
    tag = "Permissions",
    params(
        ("target_type" = String, Path, description = "department or user"),
        ("target_id" = i64, Path, description = "Department or user ID"),
    ),
    responses(
        (status = 200, description = "Rows seeded", body = SeedPermissionsResponse),
        (status = 404, description = "Target not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn seed_target_permissions(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((target_type, target_id)): Path<(String, i64)>,
) -> Result<Json<SeedPermissionsResponse>, AppError> {
    auth.principal.require_super_admin()?;
    let target = target_from_path(&target_type, target_id)?;

    let seeded = state.admin.seed_all_permissions(target, &auth.actor()).await?;

    Ok(Json(SeedPermissionsResponse {
        target_type: target.target_type(),
        target_id: target.id(),
        seeded,
    }))
}

// =============================================================================
// AUDIT
// =============================================================================

/// Permission change history, newest first
#[utoipa::path(
    get,
    path = "/permissions/audit-logs",
    tag = "Permissions",
    params(AuditLogQuery),
    responses((status = 200, description = "Audit log page", body = AuditLogPage)),
    security(("bearerAuth" = []))
)]
pub async fn list_audit_logs(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<AuditLogPage>, AppError> {
    auth.principal.require_super_admin()?;
    Ok(Json(state.admin.audit_logs(&query).await?))
}

/// Recompute the audit hash chain
#[utoipa::path(
    get,
    path = "/permissions/audit-logs/verify",
    tag = "Permissions",
    responses((status = 200, description = "Chain verification report", body = ChainReport)),
    security(("bearerAuth" = []))
)]
pub async fn verify_audit_logs(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<ChainReport>, AppError> {
    auth.principal.require_super_admin()?;
    let report = state.admin.verify_audit_chain().await?;
    if !report.valid {
        tracing::warn!(first_broken_id = ?report.first_broken_id, "audit chain verification failed");
    }
    Ok(Json(report))
}
