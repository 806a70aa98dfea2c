mod common;

use std::sync::Arc;

use anyhow::Result;
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::util::ServiceExt; // for `oneshot`

use crm_authz::authz::{PermissionCache, Principal};
use crm_authz::create_app_with;
use crm_authz::jwt::JwtConfig;
use crm_authz::models::user::Role;

use common::{create_department, insert_user, setup};

const SECRET: &str = "test-secret";

fn router(pool: &sqlx::SqlitePool) -> Router {
    let cache = Arc::new(PermissionCache::from_config(&Default::default()));
    create_app_with(pool.clone(), JwtConfig::new(SECRET), cache)
}

fn bearer(principal: Principal, name: &str) -> Result<String> {
    Ok(format!("Bearer {}", JwtConfig::new(SECRET).encode(&principal, name)?))
}

async fn send(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Result<(StatusCode, Value)> {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        req = req.header("authorization", token);
    }
    let req = match body {
        Some(body) => req
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))?,
        None => req.body(Body::empty())?,
    };

    let resp = app.clone().oneshot(req).await?;
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), 10_485_760).await?;
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes)? };
    Ok((status, value))
}

#[tokio::test]
async fn health_endpoint_reports_db_ok() -> Result<()> {
    let (_dir, pool) = setup().await?;
    let app = router(&pool);

    let (status, body) = send(&app, "GET", "/api/health", None, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["db_ok"], true);

    Ok(())
}

#[tokio::test]
async fn missing_token_is_unauthorized() -> Result<()> {
    let (_dir, pool) = setup().await?;
    let app = router(&pool);

    let (status, body) = send(&app, "GET", "/authz/me/permissions", None, None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    Ok(())
}

#[tokio::test]
async fn plain_user_is_denied_with_page_code() -> Result<()> {
    let (_dir, pool) = setup().await?;
    let app = router(&pool);

    let sales = create_department(&pool, "Sales", None).await?;
    let alice = insert_user(&pool, "alice", "user", Some(sales)).await?;
    let token = bearer(Principal::new(alice, Role::User, Some(sales)), "alice")?;

    let (status, body) = send(&app, "POST", "/departments", Some(&token), Some(json!({ "name": "Shadow IT" }))).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "permission_denied");
    assert_eq!(body["page_code"], "system.departments");

    let (status, body) = send(&app, "GET", "/authz/check/contacts.list", Some(&token), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], false);

    let (status, body) = send(&app, "GET", "/permissions/pages/tree", Some(&token), None).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    Ok(())
}

#[tokio::test]
async fn super_admin_manages_departments_and_permissions() -> Result<()> {
    let (_dir, pool) = setup().await?;
    let app = router(&pool);

    let root_id = insert_user(&pool, "root", "super_admin", None).await?;
    let root = bearer(Principal::new(root_id, Role::SuperAdmin, None), "root")?;

    // department creation seeds every active page
    let (status, sales) = send(&app, "POST", "/departments", Some(&root), Some(json!({ "name": "Sales" }))).await?;
    assert_eq!(status, StatusCode::CREATED, "{sales}");
    let sales_id = sales["id"].as_i64().unwrap_or_default();
    assert_eq!(sales["level"], 1);

    let (status, seeded) = send(&app, "GET", &format!("/permissions/target/department/{sales_id}"), Some(&root), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(seeded["permissions"].as_array().map(Vec::len), Some(10));

    let alice_id = insert_user(&pool, "alice", "user", Some(sales_id)).await?;
    let alice = bearer(Principal::new(alice_id, Role::User, Some(sales_id)), "alice")?;

    let (_, check) = send(&app, "GET", "/authz/check/contacts.delete", Some(&alice), None).await?;
    assert_eq!(check["allowed"], true);

    // personal revoke takes effect on the next request
    let (status, diff) = send(
        &app,
        "PUT",
        &format!("/permissions/target/user/{alice_id}"),
        Some(&root),
        Some(json!({ "permissions": ["dashboard", "contacts", "contacts.list"] })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK, "{diff}");
    assert_eq!(diff["total"], 3);

    let (_, check) = send(&app, "GET", "/authz/check/contacts.delete", Some(&alice), None).await?;
    assert_eq!(check["allowed"], false);

    let (status, mine) = send(&app, "GET", "/authz/me/permissions", Some(&alice), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(mine["permissions"], json!(["contacts", "contacts.list", "dashboard"]));

    // alice may read her own department's members, not others
    let (status, members) = send(&app, "GET", &format!("/departments/{sales_id}/members"), Some(&alice), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(members[0]["username"], "alice");

    let (_, other) = send(&app, "POST", "/departments", Some(&root), Some(json!({ "name": "Legal" }))).await?;
    let legal_id = other["id"].as_i64().unwrap_or_default();
    let (status, _) = send(&app, "GET", &format!("/departments/{legal_id}/members"), Some(&alice), None).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // cycles are rejected, members block deletion
    let (_, east) = send(
        &app,
        "POST",
        "/departments",
        Some(&root),
        Some(json!({ "name": "East", "parent_id": sales_id })),
    )
    .await?;
    let east_id = east["id"].as_i64().unwrap_or_default();
    assert_eq!(east["path"], format!("{sales_id}/{east_id}"));

    let (status, body) = send(
        &app,
        "PUT",
        &format!("/departments/{sales_id}"),
        Some(&root),
        Some(json!({ "parent_id": east_id })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let (status, body) = send(&app, "DELETE", &format!("/departments/{sales_id}"), Some(&root), None).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "has_children");

    let (status, _) = send(&app, "DELETE", &format!("/departments/{legal_id}"), Some(&root), None).await?;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // audit trail: three seeds and one update, newest first
    let (status, logs) = send(&app, "GET", "/permissions/audit-logs?page_size=2", Some(&root), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(logs["total"], 4);
    assert_eq!(logs["total_pages"], 2);
    assert_eq!(logs["logs"][0]["action_type"], "seed");

    let (_, filtered) = send(
        &app,
        "GET",
        &format!("/permissions/audit-logs?target_type=user&target_id={alice_id}"),
        Some(&root),
        None,
    )
    .await?;
    assert_eq!(filtered["total"], 1);
    assert_eq!(filtered["logs"][0]["operator_name"], "root");

    let (_, report) = send(&app, "GET", "/permissions/audit-logs/verify", Some(&root), None).await?;
    assert_eq!(report["valid"], true);

    Ok(())
}

#[tokio::test]
async fn invalid_target_type_is_bad_request() -> Result<()> {
    let (_dir, pool) = setup().await?;
    let app = router(&pool);
    let root = bearer(Principal::new(1, Role::SuperAdmin, None), "root")?;

    let (status, body) = send(&app, "GET", "/permissions/target/group/1", Some(&root), None).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");

    Ok(())
}
