#![allow(dead_code)]

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use tempfile::TempDir;

use crm_authz::models::department::DepartmentCreateRequest;
use crm_authz::stores::DepartmentStore;

/// Migrated SQLite database in a temp dir; keep the `TempDir` alive for the test's duration.
pub async fn setup() -> Result<(TempDir, SqlitePool)> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("test.db");
    let pool = crm_authz::db::connect(&format!("sqlite://{}", db_path.display())).await?;
    crm_authz::db::migrate(&pool).await?;
    Ok((dir, pool))
}

pub async fn insert_user(pool: &SqlitePool, username: &str, role: &str, department_id: Option<i64>) -> Result<i64> {
    let now = Utc::now();
    let id = sqlx::query(
        "INSERT INTO users (username, email, role, department_id, is_active, created_at, updated_at) VALUES (?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(username)
    .bind(format!("{username}@example.com"))
    .bind(role)
    .bind(department_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

pub async fn deactivate_user(pool: &SqlitePool, user_id: i64) -> Result<()> {
    sqlx::query("UPDATE users SET is_active = 0 WHERE id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn create_department(pool: &SqlitePool, name: &str, parent_id: Option<i64>) -> Result<i64> {
    let department = DepartmentStore::new(pool.clone())
        .create(&DepartmentCreateRequest {
            name: name.to_string(),
            parent_id,
            manager_id: None,
            description: None,
        })
        .await?;
    Ok(department.id)
}

pub fn codes(list: &[&str]) -> std::collections::BTreeSet<String> {
    list.iter().map(|c| c.to_string()).collect()
}

pub const ALL_PAGES: [&str; 10] = [
    "contacts",
    "contacts.create",
    "contacts.delete",
    "contacts.list",
    "customers",
    "customers.export",
    "customers.list",
    "dashboard",
    "system",
    "system.departments",
];
