//! Effective permission resolution.
//!
//! Order of evaluation:
//! 1. super_admin -> every active page
//! 2. department grants form the base set
//! 3. user overrides add (grant) or remove (revoke), always winning over the department
//! 4. every remaining code pulls in its ancestor pages
//! 5. inactive pages never survive

use std::collections::BTreeSet;

use sqlx::SqlitePool;

use super::Principal;
use crate::errors::AppResult;
use crate::models::permission::{OverrideEntry, TargetRef};
use crate::stores::{OverrideStore, PageCatalog, PageIndex};

#[derive(Debug, Clone)]
pub struct PermissionResolver {
    pages: PageCatalog,
    overrides: OverrideStore,
}

impl PermissionResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pages: PageCatalog::new(pool.clone()),
            overrides: OverrideStore::new(pool),
        }
    }

    pub async fn resolve(&self, principal: &Principal) -> AppResult<BTreeSet<String>> {
        if principal.is_super_admin() {
            return Ok(self.pages.active_codes().await?.into_iter().collect());
        }

        let index = self.pages.snapshot().await?;

        let department_grants: Vec<String> = match principal.department_id {
            Some(department_id) => self
                .overrides
                .for_target(TargetRef::Department(department_id))
                .await?
                .into_iter()
                .filter(|entry| entry.has_permission)
                .map(|entry| entry.page_code)
                .collect(),
            None => Vec::new(),
        };

        let user_overrides = self.overrides.for_target(TargetRef::User(principal.user_id)).await?;

        let effective = effective_codes(&index, &department_grants, &user_overrides);

        tracing::debug!(
            user_id = principal.user_id,
            department_id = ?principal.department_id,
            department_grants = department_grants.len(),
            user_overrides = user_overrides.len(),
            effective = effective.len(),
            "permissions resolved"
        );

        Ok(effective)
    }
}

/// Combines department grants with user overrides and expands ancestors.
pub fn effective_codes(
    index: &PageIndex,
    department_grants: &[String],
    user_overrides: &[OverrideEntry],
) -> BTreeSet<String> {
    let mut working: BTreeSet<&str> = department_grants.iter().map(String::as_str).collect();

    for entry in user_overrides {
        if entry.has_permission {
            working.insert(entry.page_code.as_str());
        } else {
            working.remove(entry.page_code.as_str());
        }
    }

    let mut effective = BTreeSet::new();
    for code in working {
        if !index.is_active(code) {
            continue;
        }
        effective.insert(code.to_string());
        for ancestor in index.ancestors(code) {
            if ancestor.is_active {
                effective.insert(ancestor.code.clone());
            }
        }
    }

    effective
}
