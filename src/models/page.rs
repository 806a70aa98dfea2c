use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PageType {
    Menu,
    Page,
    Action,
}

impl PageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageType::Menu => "menu",
            PageType::Page => "page",
            PageType::Action => "action",
        }
    }
}

impl std::str::FromStr for PageType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "menu" => Ok(PageType::Menu),
            "page" => Ok(PageType::Page),
            "action" => Ok(PageType::Action),
            other => Err(AppError::bad_request(format!("unknown page type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Page {
    pub id: i64,
    #[schema(example = "Delete contact")]
    pub name: String,
    #[schema(example = "contacts.delete")]
    pub code: String,
    pub parent_id: Option<i64>,
    pub page_type: PageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub sort_order: i64,
    /// Reserved for the super_admin role in menus
    pub is_system: bool,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DbPage {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub parent_id: Option<i64>,
    pub page_type: String,
    pub url: Option<String>,
    pub icon: Option<String>,
    pub sort_order: i64,
    pub is_system: bool,
    pub is_active: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbPage> for Page {
    type Error = AppError;

    fn try_from(db: DbPage) -> Result<Self, Self::Error> {
        Ok(Page {
            page_type: db.page_type.parse()?,
            id: db.id,
            name: db.name,
            code: db.code,
            parent_id: db.parent_id,
            url: db.url,
            icon: db.icon,
            sort_order: db.sort_order,
            is_system: db.is_system,
            is_active: db.is_active,
            description: db.description,
            created_at: db.created_at,
            updated_at: db.updated_at,
        })
    }
}

/// Node of the page tree handed to the permission-management UI.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PageNode {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub page_type: PageType,
    pub url: Option<String>,
    pub icon: Option<String>,
    pub is_system: bool,
    pub children: Vec<PageNode>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PageCreateRequest {
    #[schema(example = "Merge contacts")]
    pub name: String,
    #[schema(example = "contacts.merge")]
    pub code: String,
    #[schema(example = "contacts.list")]
    pub parent_code: Option<String>,
    pub page_type: PageType,
    pub url: Option<String>,
    pub icon: Option<String>,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default)]
    pub is_system: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PageActiveRequest {
    pub is_active: bool,
}
