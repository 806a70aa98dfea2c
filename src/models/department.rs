use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use super::double_option;

// =============================================================================
// DEPARTMENT
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, FromRow)]
pub struct Department {
    pub id: i64,
    #[schema(example = "Sales")]
    pub name: String,
    pub parent_id: Option<i64>,
    /// Depth in the tree, root = 1
    pub level: i64,
    /// Materialized ancestor path, e.g. `1/5/12`
    #[schema(example = "1/5")]
    pub path: String,
    pub manager_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Department {
    /// Ids encoded in the materialized path, root first, ending with this department.
    pub fn path_ids(&self) -> Vec<i64> {
        self.path
            .split('/')
            .filter_map(|segment| segment.parse::<i64>().ok())
            .collect()
    }

    /// Path and level this department must carry under `parent`.
    pub fn placement_under(id: i64, parent: Option<&Department>) -> (String, i64) {
        match parent {
            Some(parent) => (format!("{}/{}", parent.path, id), parent.level + 1),
            None => (id.to_string(), 1),
        }
    }
}

/// Department with its subtree, as returned by the tree endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DepartmentNode {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub level: i64,
    pub path: String,
    pub manager_id: Option<i64>,
    pub is_active: bool,
    pub member_count: i64,
    pub children: Vec<DepartmentNode>,
}

// =============================================================================
// REQUESTS
// =============================================================================

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct DepartmentCreateRequest {
    #[schema(example = "Sales")]
    pub name: String,
    pub parent_id: Option<i64>,
    pub manager_id: Option<i64>,
    #[schema(example = "Field and inside sales")]
    pub description: Option<String>,
}

/// Partial update. `parent_id: null` moves the department to the root; omitting it keeps the
/// current parent.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct DepartmentUpdateRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<i64>)]
    pub parent_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<i64>)]
    pub manager_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<String>)]
    pub description: Option<Option<String>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct MembersQuery {
    #[serde(default)]
    pub include_sub_departments: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn department(id: i64, path: &str, level: i64) -> Department {
        let now = Utc::now();
        Department {
            id,
            name: format!("dept-{id}"),
            parent_id: None,
            level,
            path: path.to_string(),
            manager_id: None,
            description: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn placement_extends_parent_path() {
        let parent = department(5, "1/5", 2);
        assert_eq!(Department::placement_under(12, Some(&parent)), ("1/5/12".to_string(), 3));
        assert_eq!(Department::placement_under(7, None), ("7".to_string(), 1));
    }

    #[test]
    fn path_ids_are_root_first() {
        assert_eq!(department(12, "1/5/12", 3).path_ids(), vec![1, 5, 12]);
    }

    #[test]
    fn update_request_distinguishes_null_from_absent() {
        let moved: DepartmentUpdateRequest = serde_json::from_str(r#"{"parent_id": null}"#).unwrap();
        assert_eq!(moved.parent_id, Some(None));

        let renamed: DepartmentUpdateRequest = serde_json::from_str(r#"{"name": "Ops"}"#).unwrap();
        assert_eq!(renamed.parent_id, None);
        assert_eq!(renamed.name.as_deref(), Some("Ops"));
    }
}
