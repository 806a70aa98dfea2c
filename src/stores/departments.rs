//! Organization tree store.
//!
//! Departments keep a materialized `path` (`1/5/12`) and a `level` (root = 1). Both are derived
//! from the parent and are repaired for the whole subtree whenever a department is moved.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::authz::Principal;
use crate::db::WriteTx;
use crate::errors::{AppError, AppResult};
use crate::models::department::{Department, DepartmentCreateRequest, DepartmentNode, DepartmentUpdateRequest};
use crate::models::user::{Member, Role};
use crate::stores::users::UserStore;

const DEPARTMENT_COLUMNS: &str =
    "id, name, parent_id, level, path, manager_id, description, is_active, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct DepartmentStore {
    pool: SqlitePool,
    users: UserStore,
}

impl DepartmentStore {
    pub fn new(pool: SqlitePool) -> Self {
        let users = UserStore::new(pool.clone());
        Self { pool, users }
    }

    pub async fn get(&self, id: i64) -> AppResult<Department> {
        let mut conn = self.pool.acquire().await?;
        fetch(&mut conn, id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("department {id} not found")))
    }

    pub async fn create(&self, req: &DepartmentCreateRequest) -> AppResult<Department> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(AppError::bad_request("department name must not be empty"));
        }

        let mut tx = WriteTx::begin(&self.pool).await?;

        let parent = match req.parent_id {
            Some(parent_id) => Some(
                fetch(&mut tx, parent_id)
                    .await?
                    .ok_or_else(|| AppError::not_found(format!("parent department {parent_id} not found")))?,
            ),
            None => None,
        };

        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO departments (name, parent_id, level, path, manager_id, description, is_active, created_at, updated_at)
            VALUES (?, ?, 1, '', ?, ?, 1, ?, ?)
            "#,
        )
        .bind(name)
        .bind(req.parent_id)
        .bind(req.manager_id)
        .bind(&req.description)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let (path, level) = Department::placement_under(id, parent.as_ref());
        sqlx::query("UPDATE departments SET path = ?, level = ? WHERE id = ?")
            .bind(&path)
            .bind(level)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(department_id = id, path = %path, level, "department created");

        self.get(id).await
    }

    pub async fn update(&self, id: i64, patch: &DepartmentUpdateRequest) -> AppResult<Department> {
        let mut tx = WriteTx::begin(&self.pool).await?;

        let current = fetch(&mut tx, id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("department {id} not found")))?;

        let name = match patch.name.as_deref().map(str::trim) {
            Some("") => return Err(AppError::bad_request("department name must not be empty")),
            Some(name) => name.to_string(),
            None => current.name.clone(),
        };
        let parent_id = patch.parent_id.unwrap_or(current.parent_id);
        let manager_id = patch.manager_id.unwrap_or(current.manager_id);
        let description = patch.description.clone().unwrap_or_else(|| current.description.clone());
        let is_active = patch.is_active.unwrap_or(current.is_active);

        let reparented = parent_id != current.parent_id;
        if reparented {
            if let Some(new_parent_id) = parent_id {
                if new_parent_id == id {
                    return Err(AppError::bad_request("a department cannot be its own parent"));
                }
                if fetch(&mut tx, new_parent_id).await?.is_none() {
                    return Err(AppError::not_found(format!("parent department {new_parent_id} not found")));
                }
                if descendants_of(&mut tx, &current).await?.contains(&new_parent_id) {
                    return Err(AppError::bad_request(format!(
                        "moving department {id} under {new_parent_id} would create a cycle"
                    )));
                }
            }
        }

        sqlx::query(
            r#"
            UPDATE departments
            SET name = ?, parent_id = ?, manager_id = ?, description = ?, is_active = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&name)
        .bind(parent_id)
        .bind(manager_id)
        .bind(&description)
        .bind(is_active)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if reparented {
            let repaired = repair_subtree(&mut tx, id).await?;
            tracing::info!(department_id = id, ?parent_id, repaired, "department moved");
        }

        tx.commit().await?;

        self.get(id).await
    }

    /// Deletes an empty department. Refused with no mutation while it has child departments or
    /// active members.
    pub async fn delete(&self, id: i64) -> AppResult<()> {
        let mut tx = WriteTx::begin(&self.pool).await?;

        if fetch(&mut tx, id).await?.is_none() {
            return Err(AppError::not_found(format!("department {id} not found")));
        }

        let children: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM departments WHERE parent_id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        if children > 0 {
            return Err(AppError::has_children(format!(
                "department {id} has {children} child department(s)"
            )));
        }

        let members: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE department_id = ? AND is_active = 1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        if members > 0 {
            return Err(AppError::has_members(format!("department {id} has {members} member(s)")));
        }

        sqlx::query("DELETE FROM permission_overrides WHERE target_type = 'department' AND target_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM departments WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(department_id = id, "department deleted");
        Ok(())
    }

    /// Ids of every department below `id`, at any depth.
    pub async fn descendant_ids(&self, id: i64) -> AppResult<Vec<i64>> {
        let mut conn = self.pool.acquire().await?;
        let department = fetch(&mut conn, id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("department {id} not found")))?;

        descendants_of(&mut conn, &department).await
    }

    /// Ancestors of `id`, root first, excluding the department itself.
    pub async fn ancestor_chain(&self, id: i64) -> AppResult<Vec<Department>> {
        let department = self.get(id).await?;
        let ancestor_ids: Vec<i64> = department.path_ids().into_iter().filter(|&a| a != id).collect();
        if ancestor_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {DEPARTMENT_COLUMNS} FROM departments WHERE id IN ("));
        let mut separated = builder.separated(", ");
        for ancestor_id in &ancestor_ids {
            separated.push_bind(*ancestor_id);
        }
        separated.push_unseparated(") ORDER BY level ASC");

        let chain = builder.build_query_as::<Department>().fetch_all(&self.pool).await?;
        Ok(chain)
    }

    /// Whole organization as a forest ordered by level then id.
    pub async fn tree(&self) -> AppResult<Vec<DepartmentNode>> {
        let departments = sqlx::query_as::<_, Department>(&format!(
            "SELECT {DEPARTMENT_COLUMNS} FROM departments ORDER BY level ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let counts: HashMap<i64, i64> = sqlx::query_as::<_, (i64, i64)>(
            "SELECT department_id, COUNT(*) FROM users WHERE department_id IS NOT NULL AND is_active = 1 GROUP BY department_id",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .collect();

        let mut children: HashMap<Option<i64>, Vec<&Department>> = HashMap::new();
        for department in &departments {
            children.entry(department.parent_id).or_default().push(department);
        }

        let mut visited = HashSet::new();
        Ok(build_nodes(&children, &counts, None, &mut visited))
    }

    /// Active members of `id`, optionally including every sub-department.
    pub async fn members(&self, id: i64, include_sub_departments: bool) -> AppResult<Vec<Member>> {
        let mut ids = vec![id];
        if include_sub_departments {
            ids.extend(self.descendant_ids(id).await?);
        } else {
            self.get(id).await?;
        }

        self.users.members_of(&ids).await
    }

    /// Ids of every user whose cached permissions depend on `id` or one of its sub-departments.
    pub async fn affected_user_ids(&self, id: i64) -> AppResult<Vec<i64>> {
        let mut ids = vec![id];
        match self.descendant_ids(id).await {
            Ok(descendants) => ids.extend(descendants),
            // a deleted department can still have stale cache entries for former members
            Err(AppError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        self.users.member_ids_of(&ids).await
    }

    /// Departments whose data the principal may see: everything for super_admin, the own subtree
    /// for admin, the own department for everyone else.
    pub async fn accessible_ids(&self, principal: &Principal) -> AppResult<Vec<i64>> {
        match (principal.role, principal.department_id) {
            (Role::SuperAdmin, _) => {
                let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM departments ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?;
                Ok(ids)
            }
            (Role::Admin, Some(department_id)) => {
                let mut ids = vec![department_id];
                ids.extend(self.descendant_ids(department_id).await?);
                Ok(ids)
            }
            (_, Some(department_id)) => Ok(vec![department_id]),
            (_, None) => Ok(Vec::new()),
        }
    }
}

impl DepartmentStore {
    pub async fn name_in(conn: &mut SqliteConnection, id: i64) -> AppResult<Option<String>> {
        let name = sqlx::query_scalar::<_, String>("SELECT name FROM departments WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(name)
    }
}

async fn fetch(conn: &mut SqliteConnection, id: i64) -> AppResult<Option<Department>> {
    let department = sqlx::query_as::<_, Department>(&format!(
        "SELECT {DEPARTMENT_COLUMNS} FROM departments WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(department)
}

async fn descendants_of(conn: &mut SqliteConnection, department: &Department) -> AppResult<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM departments WHERE path LIKE ? ORDER BY level ASC, id ASC")
        .bind(format!("{}/%", department.path))
        .fetch_all(&mut *conn)
        .await?;

    Ok(ids)
}

/// Recomputes path and level for `root_id` and, breadth-first, every department below it.
/// Walks `parent_id` links rather than the (possibly stale) paths being repaired.
async fn repair_subtree(conn: &mut SqliteConnection, root_id: i64) -> AppResult<usize> {
    let mut queue = VecDeque::from([root_id]);
    let mut seen = HashSet::new();

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }

        let department = fetch(conn, id)
            .await?
            .ok_or_else(|| AppError::internal(format!("department {id} vanished during path repair")))?;
        let parent = match department.parent_id {
            Some(parent_id) => fetch(conn, parent_id).await?,
            None => None,
        };

        let (path, level) = Department::placement_under(id, parent.as_ref());
        sqlx::query("UPDATE departments SET path = ?, level = ? WHERE id = ?")
            .bind(&path)
            .bind(level)
            .bind(id)
            .execute(&mut *conn)
            .await?;

        let children = sqlx::query_scalar::<_, i64>("SELECT id FROM departments WHERE parent_id = ? ORDER BY id")
            .bind(id)
            .fetch_all(&mut *conn)
            .await?;
        queue.extend(children);
    }

    Ok(seen.len())
}

fn build_nodes(
    children: &HashMap<Option<i64>, Vec<&Department>>,
    counts: &HashMap<i64, i64>,
    parent_id: Option<i64>,
    visited: &mut HashSet<i64>,
) -> Vec<DepartmentNode> {
    let Some(departments) = children.get(&parent_id) else {
        return Vec::new();
    };

    let mut nodes = Vec::with_capacity(departments.len());
    for d in departments {
        if !visited.insert(d.id) {
            continue;
        }
        nodes.push(DepartmentNode {
            id: d.id,
            name: d.name.clone(),
            parent_id: d.parent_id,
            level: d.level,
            path: d.path.clone(),
            manager_id: d.manager_id,
            is_active: d.is_active,
            member_count: counts.get(&d.id).copied().unwrap_or(0),
            children: build_nodes(children, counts, Some(d.id), visited),
        });
    }
    nodes
}
