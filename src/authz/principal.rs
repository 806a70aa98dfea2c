use crate::errors::{AppError, AppResult};
use crate::models::user::Role;

/// Authenticated identity supplied by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: i64,
    pub role: Role,
    pub department_id: Option<i64>,
}

impl Principal {
    pub fn new(user_id: i64, role: Role, department_id: Option<i64>) -> Self {
        Self { user_id, role, department_id }
    }

    pub fn is_super_admin(&self) -> bool {
        self.role == Role::SuperAdmin
    }

    pub fn require_super_admin(&self) -> AppResult<()> {
        if self.is_super_admin() {
            Ok(())
        } else {
            Err(AppError::forbidden("only super_admin may manage permissions"))
        }
    }
}
