//! Append-only permission audit log.
//!
//! Each entry is chained to its predecessor: `hash = sha256(prev_hash || entry JSON)`, so any
//! edit or removal of a past entry is detectable with [`AuditLog::verify_chain`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::errors::{AppError, AppResult};
use crate::models::audit::{AuditEntry, AuditLogPage, AuditLogQuery, ChainReport, DbAuditEntry, NewAuditEntry};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

const AUDIT_COLUMNS: &str = "id, operator_id, operator_name, action_type, target_type, target_id, target_name, changes, ip_address, user_agent, prev_hash, hash, created_at";

#[derive(Debug, Clone)]
pub struct AuditLog {
    pool: SqlitePool,
}

/// The exact stored text an entry hash covers.
#[derive(Serialize)]
struct ChainedFields<'a> {
    operator_id: i64,
    operator_name: &'a str,
    action_type: &'a str,
    target_type: &'a str,
    target_id: i64,
    target_name: &'a str,
    changes: &'a str,
    ip_address: Option<&'a str>,
    user_agent: Option<&'a str>,
    created_at: &'a str,
}

#[derive(FromRow)]
struct StoredEntry {
    id: i64,
    operator_id: i64,
    operator_name: String,
    action_type: String,
    target_type: String,
    target_id: i64,
    target_name: String,
    changes: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
    prev_hash: Option<String>,
    hash: String,
    created_at: String,
}

impl StoredEntry {
    fn fields(&self) -> ChainedFields<'_> {
        ChainedFields {
            operator_id: self.operator_id,
            operator_name: &self.operator_name,
            action_type: &self.action_type,
            target_type: &self.target_type,
            target_id: self.target_id,
            target_name: &self.target_name,
            changes: &self.changes,
            ip_address: self.ip_address.as_deref(),
            user_agent: self.user_agent.as_deref(),
            created_at: &self.created_at,
        }
    }
}

fn chain_hash(prev_hash: Option<&str>, fields: &ChainedFields<'_>) -> AppResult<String> {
    let body = serde_json::to_string(fields)
        .map_err(|e| AppError::internal(format!("failed to serialize audit entry: {e}")))?;

    let mut hasher = Sha256::new();
    if let Some(prev) = prev_hash {
        hasher.update(prev.as_bytes());
    }
    hasher.update(body.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

impl AuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Appends `entry`. Writes nothing and returns `None` when the entry carries no change.
    pub async fn record(conn: &mut SqliteConnection, entry: &NewAuditEntry) -> AppResult<Option<i64>> {
        if entry.changes.is_empty() {
            return Ok(None);
        }

        let changes = serde_json::to_string(&entry.changes)
            .map_err(|e| AppError::internal(format!("failed to serialize audit changes: {e}")))?;
        let created_at = timestamp(&Utc::now());

        let prev_hash: Option<String> =
            sqlx::query_scalar("SELECT hash FROM permission_audit_logs ORDER BY id DESC LIMIT 1")
                .fetch_optional(&mut *conn)
                .await?;

        let fields = ChainedFields {
            operator_id: entry.operator_id,
            operator_name: &entry.operator_name,
            action_type: entry.action.as_str(),
            target_type: entry.target_type.as_str(),
            target_id: entry.target_id,
            target_name: &entry.target_name,
            changes: &changes,
            ip_address: entry.context.ip.as_deref(),
            user_agent: entry.context.user_agent.as_deref(),
            created_at: &created_at,
        };
        let hash = chain_hash(prev_hash.as_deref(), &fields)?;

        let id = sqlx::query(
            r#"
            INSERT INTO permission_audit_logs
                (operator_id, operator_name, action_type, target_type, target_id, target_name, changes, ip_address, user_agent, prev_hash, hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(fields.operator_id)
        .bind(fields.operator_name)
        .bind(fields.action_type)
        .bind(fields.target_type)
        .bind(fields.target_id)
        .bind(fields.target_name)
        .bind(fields.changes)
        .bind(fields.ip_address)
        .bind(fields.user_agent)
        .bind(&prev_hash)
        .bind(&hash)
        .bind(&created_at)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        Ok(Some(id))
    }

    /// Entries newest first, optionally filtered by target and creation time.
    pub async fn list(&self, query: &AuditLogQuery) -> AppResult<AuditLogPage> {
        let page = query.page.unwrap_or(1).max(1);
        let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        let mut count: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM permission_audit_logs WHERE 1 = 1");
        push_filters(&mut count, query);
        let total = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut select: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {AUDIT_COLUMNS} FROM permission_audit_logs WHERE 1 = 1"));
        push_filters(&mut select, query);
        select
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(page_size))
            .push(" OFFSET ")
            .push_bind(i64::from(page - 1) * i64::from(page_size));

        let rows = select.build_query_as::<DbAuditEntry>().fetch_all(&self.pool).await?;
        let logs = rows.into_iter().map(AuditEntry::try_from).collect::<AppResult<Vec<_>>>()?;

        let total_pages = ((total + i64::from(page_size) - 1) / i64::from(page_size)) as u32;

        Ok(AuditLogPage { logs, total, page, page_size, total_pages })
    }

    /// Recomputes the hash chain from the first entry.
    pub async fn verify_chain(&self) -> AppResult<ChainReport> {
        let rows = sqlx::query_as::<_, StoredEntry>(&format!(
            "SELECT {AUDIT_COLUMNS} FROM permission_audit_logs ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut previous: Option<String> = None;
        for row in &rows {
            let expected = chain_hash(previous.as_deref(), &row.fields())?;
            if row.prev_hash != previous || row.hash != expected {
                tracing::error!(entry_id = row.id, "audit hash chain broken");
                return Ok(ChainReport { entries: rows.len() as i64, valid: false, first_broken_id: Some(row.id) });
            }
            previous = Some(row.hash.clone());
        }

        Ok(ChainReport { entries: rows.len() as i64, valid: true, first_broken_id: None })
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &AuditLogQuery) {
    if let Some(target_type) = query.target_type {
        builder.push(" AND target_type = ").push_bind(target_type.as_str());
    }
    if let Some(target_id) = query.target_id {
        builder.push(" AND target_id = ").push_bind(target_id);
    }
    // created_at is stored as fixed-width RFC 3339 text, so text order is time order
    if let Some(since) = query.since {
        builder.push(" AND created_at >= ").push_bind(timestamp(&since));
    }
    if let Some(until) = query.until {
        builder.push(" AND created_at < ").push_bind(timestamp(&until));
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields<'a>(changes: &'a str, created_at: &'a str) -> ChainedFields<'a> {
        ChainedFields {
            operator_id: 1,
            operator_name: "root",
            action_type: "update",
            target_type: "user",
            target_id: 42,
            target_name: "alice",
            changes,
            ip_address: None,
            user_agent: None,
            created_at,
        }
    }

    #[test]
    fn hash_depends_on_predecessor_and_content() {
        let entry = fields(r#"{"added":[],"removed":[]}"#, "2025-01-01T00:00:00.000000Z");
        let genesis = chain_hash(None, &entry).unwrap();
        let chained = chain_hash(Some(&genesis), &entry).unwrap();

        assert_eq!(genesis.len(), 64);
        assert_ne!(genesis, chained);
        assert_eq!(genesis, chain_hash(None, &entry).unwrap());

        let tampered = fields(r#"{"added":[{"code":"x","name":"x"}],"removed":[]}"#, "2025-01-01T00:00:00.000000Z");
        assert_ne!(genesis, chain_hash(None, &tampered).unwrap());
    }
}
