//! Permission override rows: one grant/revoke per (page, target type, target id).

use std::collections::BTreeSet;

use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::errors::{AppError, AppResult};
use crate::models::permission::{OverrideEntry, PermissionDiff, TargetRef};

/// Rows per multi-row INSERT; keeps well under SQLite's bind-parameter limit.
const INSERT_CHUNK: usize = 100;

#[derive(Debug, Clone)]
pub struct OverrideStore {
    pool: SqlitePool,
}

impl OverrideStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Every override row of `target`, active pages or not.
    pub async fn for_target(&self, target: TargetRef) -> AppResult<Vec<OverrideEntry>> {
        let entries = sqlx::query_as::<_, OverrideEntry>(
            r#"
            SELECT p.code AS page_code, o.has_permission
            FROM permission_overrides o
            INNER JOIN pages p ON p.id = o.page_id
            WHERE o.target_type = ? AND o.target_id = ?
            ORDER BY p.sort_order ASC, p.id ASC
            "#,
        )
        .bind(target.target_type().as_str())
        .bind(target.id())
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// Codes of active pages `target` is explicitly granted.
    pub async fn granted_codes(&self, target: TargetRef) -> AppResult<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        Ok(granted_codes_in(&mut conn, target).await?.into_iter().collect())
    }

    /// Replaces every row of `target` with one row per active page, granted iff its code is in
    /// `granted`. Unknown or inactive codes are rejected before anything is written.
    ///
    /// Runs on the caller's connection so it can share a transaction with the audit entry.
    pub async fn replace_for_target(
        conn: &mut SqliteConnection,
        target: TargetRef,
        granted: &BTreeSet<String>,
        actor_id: i64,
    ) -> AppResult<PermissionDiff> {
        let pages = sqlx::query_as::<_, (i64, String)>(
            "SELECT id, code FROM pages WHERE is_active = 1 ORDER BY sort_order ASC, id ASC",
        )
        .fetch_all(&mut *conn)
        .await?;

        let known: BTreeSet<&str> = pages.iter().map(|(_, code)| code.as_str()).collect();
        let unknown: Vec<&str> = granted
            .iter()
            .map(String::as_str)
            .filter(|code| !known.contains(code))
            .collect();
        if !unknown.is_empty() {
            return Err(AppError::bad_request(format!(
                "unknown or inactive page codes: {}",
                unknown.join(", ")
            )));
        }

        let previous = granted_codes_in(conn, target).await?;
        let diff = PermissionDiff {
            added: granted.difference(&previous).cloned().collect(),
            removed: previous.difference(granted).cloned().collect(),
        };

        Self::delete_for_target(conn, target).await?;

        let now = Utc::now();
        for chunk in pages.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO permission_overrides (page_id, target_type, target_id, has_permission, created_by, created_at, updated_at) ",
            );
            builder.push_values(chunk, |mut row, (page_id, code)| {
                row.push_bind(*page_id)
                    .push_bind(target.target_type().as_str())
                    .push_bind(target.id())
                    .push_bind(granted.contains(code))
                    .push_bind(actor_id)
                    .push_bind(now)
                    .push_bind(now);
            });
            builder.build().execute(&mut *conn).await?;
        }

        tracing::debug!(
            subject = %target,
            pages = pages.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            "override rows replaced"
        );

        Ok(diff)
    }

    /// Grants every active page to `target`, keeping any row that already exists.
    pub async fn seed_all(conn: &mut SqliteConnection, target: TargetRef, actor_id: i64) -> AppResult<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO permission_overrides (page_id, target_type, target_id, has_permission, created_by, created_at, updated_at)
            SELECT id, ?, ?, 1, ?, ?, ? FROM pages WHERE is_active = 1
            "#,
        )
        .bind(target.target_type().as_str())
        .bind(target.id())
        .bind(actor_id)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete_for_target(conn: &mut SqliteConnection, target: TargetRef) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM permission_overrides WHERE target_type = ? AND target_id = ?")
            .bind(target.target_type().as_str())
            .bind(target.id())
            .execute(&mut *conn)
            .await?;

        Ok(result.rows_affected())
    }
}

pub(crate) async fn granted_codes_in(conn: &mut SqliteConnection, target: TargetRef) -> AppResult<BTreeSet<String>> {
    let codes = sqlx::query_scalar::<_, String>(
        r#"
        SELECT p.code
        FROM permission_overrides o
        INNER JOIN pages p ON p.id = o.page_id
        WHERE o.target_type = ? AND o.target_id = ? AND o.has_permission = 1 AND p.is_active = 1
        "#,
    )
    .bind(target.target_type().as_str())
    .bind(target.id())
    .fetch_all(&mut *conn)
    .await?;

    Ok(codes.into_iter().collect())
}
