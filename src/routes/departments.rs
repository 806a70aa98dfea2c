//! Organization tree endpoints.
//!
//! Reads need a valid token; writes need the `system.departments` page.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};

use crate::app::AppState;
use crate::authz::pages::SYSTEM_DEPARTMENTS;
use crate::errors::AppError;
use crate::jwt::AuthUser;
use crate::models::department::{
    Department, DepartmentCreateRequest, DepartmentNode, DepartmentUpdateRequest, MembersQuery,
};
use crate::models::permission::TargetRef;
use crate::models::user::Member;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", axum::routing::post(create_department))
        .route("/tree", get(department_tree))
        .route("/:id", get(get_department).put(update_department).delete(delete_department))
        .route("/:id/ancestors", get(department_ancestors))
        .route("/:id/members", get(department_members))
}

// =============================================================================
// READS
// =============================================================================

/// Whole organization tree
#[utoipa::path(
    get,
    path = "/departments/tree",
    tag = "Departments",
    responses((status = 200, description = "Department forest", body = Vec<DepartmentNode>)),
    security(("bearerAuth" = []))
)]
pub async fn department_tree(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<Vec<DepartmentNode>>, AppError> {
    Ok(Json(state.departments.tree().await?))
}

#[utoipa::path(
    get,
    path = "/departments/{id}",
    tag = "Departments",
    params(("id" = i64, Path, description = "Department ID")),
    responses(
        (status = 200, description = "Department", body = Department),
        (status = 404, description = "Department not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn get_department(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Department>, AppError> {
    Ok(Json(state.departments.get(id).await?))
}

/// Ancestors of a department, root first
#[utoipa::path(
    get,
    path = "/departments/{id}/ancestors",
    tag = "Departments",
    params(("id" = i64, Path, description = "Department ID")),
    responses(
        (status = 200, description = "Ancestor chain", body = Vec<Department>),
        (status = 404, description = "Department not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn department_ancestors(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Vec<Department>>, AppError> {
    Ok(Json(state.departments.ancestor_chain(id).await?))
}

/// Active members, optionally including every sub-department
#[utoipa::path(
    get,
    path = "/departments/{id}/members",
    tag = "Departments",
    params(("id" = i64, Path, description = "Department ID"), MembersQuery),
    responses(
        (status = 200, description = "Members", body = Vec<Member>),
        (status = 403, description = "Department outside the caller's scope"),
        (status = 404, description = "Department not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn department_members(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Query(query): Query<MembersQuery>,
) -> Result<Json<Vec<Member>>, AppError> {
    let accessible = state.departments.accessible_ids(&auth.principal).await?;
    if !accessible.contains(&id) {
        tracing::debug!(user_id = %auth.principal.user_id, department_id = id, "department outside access scope");
        return Err(AppError::forbidden(format!("department {id} is outside your scope")));
    }

    Ok(Json(state.departments.members(id, query.include_sub_departments).await?))
}

// =============================================================================
// WRITES
// =============================================================================

/// Create a department; it starts with every active page granted
#[utoipa::path(
    post,
    path = "/departments",
    tag = "Departments",
    request_body = DepartmentCreateRequest,
    responses(
        (status = 201, description = "Department created", body = Department),
        (status = 403, description = "Missing system.departments permission"),
        (status = 404, description = "Parent not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_department(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<DepartmentCreateRequest>,
) -> Result<(StatusCode, Json<Department>), AppError> {
    state.gate.require(&auth.principal, SYSTEM_DEPARTMENTS).await?;

    let department = state.departments.create(&req).await?;
    state
        .admin
        .seed_all_permissions(TargetRef::Department(department.id), &auth.actor())
        .await?;

    Ok((StatusCode::CREATED, Json(department)))
}

/// Update a department; changing `parent_id` moves its whole subtree
#[utoipa::path(
    put,
    path = "/departments/{id}",
    tag = "Departments",
    params(("id" = i64, Path, description = "Department ID")),
    request_body = DepartmentUpdateRequest,
    responses(
        (status = 200, description = "Department updated", body = Department),
        (status = 400, description = "Self-parent or cycle"),
        (status = 403, description = "Missing system.departments permission"),
        (status = 404, description = "Department or parent not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn update_department(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<DepartmentUpdateRequest>,
) -> Result<Json<Department>, AppError> {
    state.gate.require(&auth.principal, SYSTEM_DEPARTMENTS).await?;

    Ok(Json(state.departments.update(id, &req).await?))
}

#[utoipa::path(
    delete,
    path = "/departments/{id}",
    tag = "Departments",
    params(("id" = i64, Path, description = "Department ID")),
    responses(
        (status = 204, description = "Department deleted"),
        (status = 403, description = "Missing system.departments permission"),
        (status = 404, description = "Department not found"),
        (status = 409, description = "Department has children or members"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn delete_department(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.gate.require(&auth.principal, SYSTEM_DEPARTMENTS).await?;

    state.departments.delete(id).await?;
    state.admin.invalidate_target(TargetRef::Department(id)).await;

    Ok(StatusCode::NO_CONTENT)
}
