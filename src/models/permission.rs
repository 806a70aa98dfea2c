use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use crate::errors::AppError;
use crate::models::user::Role;

// =============================================================================
// TARGETS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Department,
    User,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Department => "department",
            TargetType::User => "user",
        }
    }
}

impl std::str::FromStr for TargetType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "department" => Ok(TargetType::Department),
            "user" => Ok(TargetType::User),
            other => Err(AppError::bad_request(format!("invalid target type: {other}"))),
        }
    }
}

/// Subject of a permission override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetRef {
    Department(i64),
    User(i64),
}

impl TargetRef {
    pub fn new(target_type: TargetType, id: i64) -> Self {
        match target_type {
            TargetType::Department => TargetRef::Department(id),
            TargetType::User => TargetRef::User(id),
        }
    }

    pub fn target_type(&self) -> TargetType {
        match self {
            TargetRef::Department(_) => TargetType::Department,
            TargetRef::User(_) => TargetType::User,
        }
    }

    pub fn id(&self) -> i64 {
        match *self {
            TargetRef::Department(id) | TargetRef::User(id) => id,
        }
    }
}

impl std::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.target_type().as_str(), self.id())
    }
}

// =============================================================================
// OVERRIDES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema, FromRow)]
pub struct OverrideEntry {
    #[schema(example = "contacts.delete")]
    pub page_code: String,
    pub has_permission: bool,
}

impl OverrideEntry {
    pub fn grant(code: impl Into<String>) -> Self {
        Self { page_code: code.into(), has_permission: true }
    }

    pub fn revoke(code: impl Into<String>) -> Self {
        Self { page_code: code.into(), has_permission: false }
    }
}

/// Codes gained and lost by a full replace, each sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PermissionDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl PermissionDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

// =============================================================================
// API PAYLOADS
// =============================================================================

#[derive(Debug, Serialize, ToSchema)]
pub struct TargetPermissions {
    pub target_type: TargetType,
    pub target_id: i64,
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateTargetPermissionsRequest {
    #[schema(example = json!(["dashboard", "contacts.list"]))]
    pub permissions: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UpdateTargetPermissionsResponse {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub total: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SeedPermissionsResponse {
    pub target_type: TargetType,
    pub target_id: i64,
    pub seeded: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EffectivePermissions {
    pub user_id: i64,
    pub role: Role,
    pub department_id: Option<i64>,
    pub permissions: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CheckResponse {
    #[schema(example = "contacts.delete")]
    pub code: String,
    pub allowed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_ref_keeps_type_and_id() {
        let target = TargetRef::new("department".parse().unwrap(), 5);
        assert_eq!(target, TargetRef::Department(5));
        assert_eq!(target.target_type(), TargetType::Department);
        assert_eq!(target.id(), 5);
        assert_eq!(target.to_string(), "department:5");
    }

    #[test]
    fn unknown_target_type_is_rejected() {
        assert!(matches!("group".parse::<TargetType>(), Err(AppError::BadRequest(_))));
    }
}
