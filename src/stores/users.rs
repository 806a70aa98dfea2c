//! Read-only member directory. Users are provisioned elsewhere; the permission engine only
//! enumerates department members, for listings and cache fan-out.

use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::errors::AppResult;
use crate::models::user::{DbMember, Member};

const MEMBER_COLUMNS: &str = "id, username, email, role, department_id, is_active, created_at";

#[derive(Debug, Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Active members of any of `department_ids`, ordered by role then username.
    pub async fn members_of(&self, department_ids: &[i64]) -> AppResult<Vec<Member>> {
        if department_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {MEMBER_COLUMNS} FROM users WHERE is_active = 1 AND department_id IN ("));
        let mut separated = builder.separated(", ");
        for id in department_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY role ASC, username ASC");

        let rows = builder.build_query_as::<DbMember>().fetch_all(&self.pool).await?;
        rows.into_iter().map(Member::try_from).collect()
    }

    /// Ids of every user, active or not, whose department is one of `department_ids`.
    pub async fn member_ids_of(&self, department_ids: &[i64]) -> AppResult<Vec<i64>> {
        if department_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT id FROM users WHERE department_id IN (");
        let mut separated = builder.separated(", ");
        for id in department_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let ids = builder.build_query_scalar::<i64>().fetch_all(&self.pool).await?;
        Ok(ids)
    }

    pub async fn username_in(conn: &mut SqliteConnection, id: i64) -> AppResult<Option<String>> {
        let username = sqlx::query_scalar::<_, String>("SELECT username FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(username)
    }
}
