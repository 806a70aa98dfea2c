//! Persistence for departments, pages, overrides and the audit log.
//!
//! Nothing outside this module touches those tables directly.

use sqlx::SqliteConnection;

use crate::errors::{AppError, AppResult};
use crate::models::permission::TargetRef;

pub mod audit;
pub mod departments;
pub mod overrides;
pub mod pages;
pub mod users;

pub use audit::AuditLog;
pub use departments::DepartmentStore;
pub use overrides::OverrideStore;
pub use pages::{PageCatalog, PageIndex};
pub use users::UserStore;

/// Display name of a department or user; `NotFound` when it does not exist.
pub async fn target_name(conn: &mut SqliteConnection, target: TargetRef) -> AppResult<String> {
    let name = match target {
        TargetRef::Department(id) => DepartmentStore::name_in(conn, id).await?,
        TargetRef::User(id) => UserStore::username_in(conn, id).await?,
    };

    name.ok_or_else(|| AppError::not_found(format!("{} {} not found", target.target_type().as_str(), target.id())))
}
