//! Permission administration: page catalog maintenance, full-replace updates of a target's
//! permission set, lifecycle seeding and the audit trail.
//!
//! Every write follows the same order: per-target lock, transaction, rows, audit savepoint,
//! commit, cache invalidation.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::PermissionCache;
use crate::db::{self, WriteTx};
use crate::errors::AppResult;
use crate::models::audit::{
    AuditAction, AuditChange, AuditChanges, AuditLogPage, AuditLogQuery, ChainReport, NewAuditEntry, RequestContext,
};
use crate::models::page::{Page, PageCreateRequest, PageNode};
use crate::models::permission::{PermissionDiff, TargetPermissions, TargetRef};
use crate::stores::overrides::granted_codes_in;
use crate::stores::{target_name, AuditLog, DepartmentStore, OverrideStore, PageCatalog};

const AUDIT_SAVEPOINT: &str = "audit_entry";

type TargetLocks = DashMap<TargetRef, Arc<Mutex<()>>>;

/// Operator performing an administrative write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: i64,
    pub name: String,
}

impl Actor {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateTargetPermissions {
    pub target: TargetRef,
    pub codes: BTreeSet<String>,
    pub actor: Actor,
    pub context: RequestContext,
}

#[derive(Debug, Clone)]
pub struct PermissionAdmin {
    pool: SqlitePool,
    pages: PageCatalog,
    overrides: OverrideStore,
    audit: AuditLog,
    departments: DepartmentStore,
    cache: Arc<PermissionCache>,
    locks: Arc<TargetLocks>,
}

impl PermissionAdmin {
    pub fn new(pool: SqlitePool, cache: Arc<PermissionCache>) -> Self {
        Self {
            pages: PageCatalog::new(pool.clone()),
            overrides: OverrideStore::new(pool.clone()),
            audit: AuditLog::new(pool.clone()),
            departments: DepartmentStore::new(pool.clone()),
            pool,
            cache,
            locks: Arc::new(DashMap::new()),
        }
    }

    // =========================================================================
    // PAGE CATALOG
    // =========================================================================

    pub async fn page_tree(&self) -> AppResult<Vec<PageNode>> {
        self.pages.tree().await
    }

    pub async fn parent_chain(&self, code: &str) -> AppResult<Vec<Page>> {
        self.pages.parent_chain(code).await
    }

    pub async fn create_page(&self, req: &PageCreateRequest) -> AppResult<Page> {
        let page = self.pages.create(req).await?;
        self.cache.clear().await;
        Ok(page)
    }

    /// Ancestor expansion depends on the whole catalog, so any activation change drops every
    /// cached set.
    pub async fn set_page_active(&self, code: &str, is_active: bool) -> AppResult<Page> {
        let page = self.pages.set_active(code, is_active).await?;
        self.cache.clear().await;
        Ok(page)
    }

    // =========================================================================
    // TARGET PERMISSIONS
    // =========================================================================

    pub async fn target_permissions(&self, target: TargetRef) -> AppResult<TargetPermissions> {
        let mut conn = self.pool.acquire().await?;
        target_name(&mut conn, target).await?;
        drop(conn);

        Ok(TargetPermissions {
            target_type: target.target_type(),
            target_id: target.id(),
            permissions: self.overrides.granted_codes(target).await?,
        })
    }

    /// Replaces the whole permission set of a target. Writers to the same target are
    /// serialized; the cache is invalidated only after the commit.
    pub async fn update_target_permissions(&self, cmd: UpdateTargetPermissions) -> AppResult<PermissionDiff> {
        let UpdateTargetPermissions { target, codes, actor, context } = cmd;

        let _lock = self.lock_target(target).await;

        let mut tx = WriteTx::begin(&self.pool).await?;
        let name = target_name(&mut tx, target).await?;

        let diff = OverrideStore::replace_for_target(&mut tx, target, &codes, actor.id).await?;

        if !diff.is_empty() {
            let changes = describe_changes(&mut tx, &diff).await?;
            let entry = NewAuditEntry {
                operator_id: actor.id,
                operator_name: actor.name.clone(),
                action: AuditAction::Update,
                target_type: target.target_type(),
                target_id: target.id(),
                target_name: name,
                changes,
                context,
            };
            record_in_savepoint(&mut tx, &entry).await;
        }

        tx.commit().await?;

        tracing::info!(
            subject = %target,
            operator_id = actor.id,
            added = diff.added.len(),
            removed = diff.removed.len(),
            "permissions updated"
        );

        self.invalidate_target(target).await;

        Ok(diff)
    }

    /// Grants every active page to a newly created department or user. Existing rows are kept,
    /// so seeding twice changes nothing.
    pub async fn seed_all_permissions(&self, target: TargetRef, actor: &Actor) -> AppResult<u64> {
        let _lock = self.lock_target(target).await;

        let mut tx = WriteTx::begin(&self.pool).await?;
        let name = target_name(&mut tx, target).await?;

        let before = granted_codes_in(&mut tx, target).await?;
        let seeded = OverrideStore::seed_all(&mut tx, target, actor.id).await?;

        if seeded > 0 {
            let after = granted_codes_in(&mut tx, target).await?;
            let diff = PermissionDiff {
                added: after.difference(&before).cloned().collect(),
                removed: Vec::new(),
            };
            let changes = describe_changes(&mut tx, &diff).await?;
            let entry = NewAuditEntry {
                operator_id: actor.id,
                operator_name: actor.name.clone(),
                action: AuditAction::Seed,
                target_type: target.target_type(),
                target_id: target.id(),
                target_name: name,
                changes,
                context: RequestContext::new(),
            };
            record_in_savepoint(&mut tx, &entry).await;
        }

        tx.commit().await?;

        tracing::info!(subject = %target, seeded, "permissions seeded");

        if seeded > 0 {
            self.invalidate_target(target).await;
        }

        Ok(seeded)
    }

    /// Drops cached sets that depend on `target`: the user, or every member of the department
    /// and its sub-departments.
    pub async fn invalidate_target(&self, target: TargetRef) {
        match target {
            TargetRef::User(user_id) => self.cache.invalidate_user(user_id).await,
            TargetRef::Department(department_id) => {
                self.cache.invalidate_department(department_id, &self.departments).await;
            }
        }
    }

    // =========================================================================
    // AUDIT
    // =========================================================================

    pub async fn audit_logs(&self, query: &AuditLogQuery) -> AppResult<AuditLogPage> {
        self.audit.list(query).await
    }

    pub async fn verify_audit_chain(&self) -> AppResult<ChainReport> {
        self.audit.verify_chain().await
    }

    async fn lock_target(&self, target: TargetRef) -> TargetLock<'_> {
        let mutex = self.locks.entry(target).or_default().clone();
        let guard = mutex.lock_owned().await;
        TargetLock { locks: &self.locks, target, guard: Some(guard) }
    }
}

/// Exclusive write access to one target. The map entry is dropped with the last holder, so the
/// lock map only grows with targets being written right now.
struct TargetLock<'a> {
    locks: &'a TargetLocks,
    target: TargetRef,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TargetLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.remove_if(&self.target, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

async fn describe_changes(conn: &mut SqliteConnection, diff: &PermissionDiff) -> AppResult<AuditChanges> {
    let names = PageCatalog::names_in(conn).await?;

    Ok(AuditChanges {
        added: named(&names, &diff.added),
        removed: named(&names, &diff.removed),
    })
}

fn named(names: &HashMap<String, String>, codes: &[String]) -> Vec<AuditChange> {
    codes
        .iter()
        .map(|code| AuditChange {
            code: code.clone(),
            name: names.get(code).cloned().unwrap_or_else(|| code.clone()),
        })
        .collect()
}

/// Appends the entry inside a savepoint. A failed append is rolled back on its own and logged;
/// the surrounding permission write still commits.
async fn record_in_savepoint(conn: &mut SqliteConnection, entry: &NewAuditEntry) -> Option<i64> {
    if let Err(err) = db::savepoint(conn, AUDIT_SAVEPOINT).await {
        tracing::error!(target_id = entry.target_id, error = %err, "could not open audit savepoint");
        return None;
    }

    match AuditLog::record(conn, entry).await {
        Ok(id) => match db::release_savepoint(conn, AUDIT_SAVEPOINT).await {
            Ok(()) => id,
            Err(err) => {
                tracing::error!(target_id = entry.target_id, error = %err, "failed to release audit savepoint");
                None
            }
        },
        Err(err) => {
            tracing::error!(
                target_type = entry.target_type.as_str(),
                target_id = entry.target_id,
                operator_id = entry.operator_id,
                error = %err,
                "failed to write permission audit entry"
            );
            if let Err(err) = db::rollback_to_savepoint(conn, AUDIT_SAVEPOINT).await {
                tracing::error!(error = %err, "failed to roll back audit savepoint");
            }
            None
        }
    }
}
