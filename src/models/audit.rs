use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::{IntoParams, ToSchema};

use crate::errors::AppError;
use crate::models::permission::TargetType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    /// Full replace of a target's permission set
    Update,
    /// Lifecycle seeding of a new department or user
    Seed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Update => "update",
            AuditAction::Seed => "seed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AuditChange {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AuditChanges {
    pub added: Vec<AuditChange>,
    pub removed: Vec<AuditChange>,
}

impl AuditChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Request context recorded with each audit entry (IP, User-Agent).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract context from Axum request headers
    pub fn from_headers(headers: &axum::http::HeaderMap) -> Self {
        let ip = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
            .or_else(|| {
                headers
                    .get("x-real-ip")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            });

        let user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        Self { ip, user_agent }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }
}

/// Entry about to be appended to the audit log.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub operator_id: i64,
    pub operator_name: String,
    pub action: AuditAction,
    pub target_type: TargetType,
    pub target_id: i64,
    pub target_name: String,
    pub changes: AuditChanges,
    pub context: RequestContext,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AuditEntry {
    pub id: i64,
    pub operator_id: i64,
    pub operator_name: String,
    pub action_type: String,
    pub target_type: TargetType,
    pub target_id: i64,
    pub target_name: String,
    pub changes: AuditChanges,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub prev_hash: Option<String>,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DbAuditEntry {
    pub id: i64,
    pub operator_id: i64,
    pub operator_name: String,
    pub action_type: String,
    pub target_type: String,
    pub target_id: i64,
    pub target_name: String,
    pub changes: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub prev_hash: Option<String>,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbAuditEntry> for AuditEntry {
    type Error = AppError;

    fn try_from(db: DbAuditEntry) -> Result<Self, Self::Error> {
        let changes = serde_json::from_str(&db.changes)
            .map_err(|e| AppError::internal(format!("corrupt audit changes for entry {}: {e}", db.id)))?;

        Ok(AuditEntry {
            target_type: db.target_type.parse()?,
            changes,
            id: db.id,
            operator_id: db.operator_id,
            operator_name: db.operator_name,
            action_type: db.action_type,
            target_id: db.target_id,
            target_name: db.target_name,
            ip_address: db.ip_address,
            user_agent: db.user_agent,
            prev_hash: db.prev_hash,
            hash: db.hash,
            created_at: db.created_at,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuditLogQuery {
    /// 1-based page number
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub target_type: Option<TargetType>,
    pub target_id: Option<i64>,
    /// Entries created at or after this instant (RFC 3339)
    pub since: Option<DateTime<Utc>>,
    /// Entries created strictly before this instant (RFC 3339)
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuditLogPage {
    pub logs: Vec<AuditEntry>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ChainReport {
    pub entries: i64,
    pub valid: bool,
    pub first_broken_id: Option<i64>,
}
