//! Page catalog: the tree of menus, pages and actions that permissions are granted on.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};

use crate::errors::{AppError, AppResult};
use crate::models::page::{DbPage, Page, PageCreateRequest, PageNode};

const PAGE_COLUMNS: &str = "id, name, code, parent_id, page_type, url, icon, sort_order, is_system, is_active, description, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PageCatalog {
    pool: SqlitePool,
}

impl PageCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Every page, active or not, in display order.
    pub async fn all(&self) -> AppResult<Vec<Page>> {
        let rows = sqlx::query_as::<_, DbPage>(&format!(
            "SELECT {PAGE_COLUMNS} FROM pages ORDER BY sort_order ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Page::try_from).collect()
    }

    pub async fn snapshot(&self) -> AppResult<PageIndex> {
        Ok(PageIndex::from_pages(self.all().await?))
    }

    pub async fn tree(&self) -> AppResult<Vec<PageNode>> {
        Ok(self.snapshot().await?.tree())
    }

    pub async fn find_by_code(&self, code: &str) -> AppResult<Page> {
        let row = sqlx::query_as::<_, DbPage>(&format!("SELECT {PAGE_COLUMNS} FROM pages WHERE code = ?"))
            .bind(code)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found(format!("page {code} not found")))?;

        Page::try_from(row)
    }

    /// Parent chain of `code`, nearest parent first, ending at the root.
    pub async fn parent_chain(&self, code: &str) -> AppResult<Vec<Page>> {
        let index = self.snapshot().await?;
        if index.get(code).is_none() {
            return Err(AppError::not_found(format!("page {code} not found")));
        }

        Ok(index.ancestors(code).into_iter().cloned().collect())
    }

    /// Display name of every page keyed by code, read on the caller's connection.
    pub async fn names_in(conn: &mut SqliteConnection) -> AppResult<HashMap<String, String>> {
        let names = sqlx::query_as::<_, (String, String)>("SELECT code, name FROM pages")
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .collect();

        Ok(names)
    }

    pub async fn active_codes(&self) -> AppResult<Vec<String>> {
        let codes = sqlx::query_scalar::<_, String>(
            "SELECT code FROM pages WHERE is_active = 1 ORDER BY sort_order ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(codes)
    }

    pub async fn create(&self, req: &PageCreateRequest) -> AppResult<Page> {
        let code = req.code.trim();
        if code.is_empty() || code.chars().any(char::is_whitespace) {
            return Err(AppError::bad_request("page code must be non-empty and contain no whitespace"));
        }
        if req.name.trim().is_empty() {
            return Err(AppError::bad_request("page name must not be empty"));
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM pages WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_some() {
            return Err(AppError::conflict(format!("page code {code} already exists")));
        }

        let parent_id = match req.parent_code.as_deref() {
            Some(parent_code) => Some(self.find_by_code(parent_code).await?.id),
            None => None,
        };

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO pages (name, code, parent_id, page_type, url, icon, sort_order, is_system, is_active, description, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
            "#,
        )
        .bind(req.name.trim())
        .bind(code)
        .bind(parent_id)
        .bind(req.page_type.as_str())
        .bind(&req.url)
        .bind(&req.icon)
        .bind(req.sort_order)
        .bind(req.is_system)
        .bind(&req.description)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                AppError::conflict(format!("page code {code} already exists"))
            }
            other => AppError::from(other),
        })?;

        tracing::info!(page_id = result.last_insert_rowid(), code = %code, "page created");

        self.find_by_code(code).await
    }

    pub async fn set_active(&self, code: &str, is_active: bool) -> AppResult<Page> {
        let result = sqlx::query("UPDATE pages SET is_active = ?, updated_at = ? WHERE code = ?")
            .bind(is_active)
            .bind(Utc::now())
            .bind(code)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("page {code} not found")));
        }

        tracing::info!(code = %code, is_active, "page activation changed");

        self.find_by_code(code).await
    }
}

/// In-memory view of the whole catalog, built once per resolution.
#[derive(Debug, Clone, Default)]
pub struct PageIndex {
    pages: Vec<Page>,
    by_id: HashMap<i64, usize>,
    by_code: HashMap<String, usize>,
}

impl PageIndex {
    /// `pages` are expected in display order; tree children keep that order.
    pub fn from_pages(pages: Vec<Page>) -> Self {
        let by_id = pages.iter().enumerate().map(|(i, p)| (p.id, i)).collect();
        let by_code = pages.iter().enumerate().map(|(i, p)| (p.code.clone(), i)).collect();
        Self { pages, by_id, by_code }
    }

    pub fn get(&self, code: &str) -> Option<&Page> {
        self.by_code.get(code).map(|&i| &self.pages[i])
    }

    pub fn is_active(&self, code: &str) -> bool {
        self.get(code).map(|p| p.is_active).unwrap_or(false)
    }

    pub fn active_codes(&self) -> BTreeSet<String> {
        self.pages
            .iter()
            .filter(|p| p.is_active)
            .map(|p| p.code.clone())
            .collect()
    }

    /// Walks parent pointers from `code` to the root, nearest parent first.
    /// A parent cycle in stored data stops the walk instead of looping.
    pub fn ancestors(&self, code: &str) -> Vec<&Page> {
        let mut chain = Vec::new();
        let Some(start) = self.get(code) else {
            return chain;
        };

        let mut seen = HashSet::from([start.id]);
        let mut parent_id = start.parent_id;
        while let Some(id) = parent_id {
            let Some(&i) = self.by_id.get(&id) else {
                break;
            };
            if !seen.insert(id) {
                tracing::warn!(page = %code, parent_id = id, "cycle in page parent chain");
                break;
            }
            let parent = &self.pages[i];
            chain.push(parent);
            parent_id = parent.parent_id;
        }

        chain
    }

    /// Active pages as a tree. Children of an inactive page are hidden with it.
    pub fn tree(&self) -> Vec<PageNode> {
        let mut children: HashMap<Option<i64>, Vec<&Page>> = HashMap::new();
        for page in self.pages.iter().filter(|p| p.is_active) {
            children.entry(page.parent_id).or_default().push(page);
        }

        let mut visited = HashSet::new();
        build_nodes(&children, None, &mut visited)
    }
}

fn build_nodes(
    children: &HashMap<Option<i64>, Vec<&Page>>,
    parent_id: Option<i64>,
    visited: &mut HashSet<i64>,
) -> Vec<PageNode> {
    let Some(pages) = children.get(&parent_id) else {
        return Vec::new();
    };

    let mut nodes = Vec::with_capacity(pages.len());
    for page in pages {
        if !visited.insert(page.id) {
            continue;
        }
        nodes.push(PageNode {
            id: page.id,
            name: page.name.clone(),
            code: page.code.clone(),
            page_type: page.page_type,
            url: page.url.clone(),
            icon: page.icon.clone(),
            is_system: page.is_system,
            children: build_nodes(children, Some(page.id), visited),
        });
    }
    nodes
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::page::PageType;

    pub(crate) fn page(id: i64, code: &str, parent_id: Option<i64>, is_active: bool) -> Page {
        let now = Utc::now();
        Page {
            id,
            name: code.to_string(),
            code: code.to_string(),
            parent_id,
            page_type: if parent_id.is_some() { PageType::Action } else { PageType::Menu },
            url: None,
            icon: None,
            sort_order: 0,
            is_system: false,
            is_active,
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn ancestors_are_nearest_first() {
        let index = PageIndex::from_pages(vec![
            page(1, "root", None, true),
            page(2, "mid", Some(1), true),
            page(3, "leaf", Some(2), true),
        ]);

        let chain: Vec<&str> = index.ancestors("leaf").iter().map(|p| p.code.as_str()).collect();
        assert_eq!(chain, vec!["mid", "root"]);
        assert!(index.ancestors("root").is_empty());
        assert!(index.ancestors("missing").is_empty());
    }

    #[test]
    fn ancestors_stop_on_cycles() {
        let index = PageIndex::from_pages(vec![page(1, "a", Some(2), true), page(2, "b", Some(1), true)]);
        let chain: Vec<&str> = index.ancestors("a").iter().map(|p| p.code.as_str()).collect();
        assert_eq!(chain, vec!["b"]);
    }

    #[test]
    fn tree_hides_inactive_subtrees() {
        let index = PageIndex::from_pages(vec![
            page(1, "contacts", None, true),
            page(2, "contacts.list", Some(1), true),
            page(3, "reports", None, false),
            page(4, "reports.sales", Some(3), true),
        ]);

        let tree = index.tree();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].code, "contacts");
        assert_eq!(tree[0].children[0].code, "contacts.list");
        assert_eq!(index.active_codes().len(), 3);
        assert!(!index.is_active("reports"));
    }
}
