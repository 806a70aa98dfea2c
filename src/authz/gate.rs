use std::collections::BTreeSet;
use std::sync::Arc;

use super::{PermissionCache, PermissionResolver, Principal};
use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { code: String },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Page-code checks for request handlers.
///
/// Evaluation order:
/// 1. super_admin -> allow, no lookup
/// 2. cached effective set
/// 3. resolved effective set, written back to the cache
/// 4. membership test
#[derive(Debug, Clone)]
pub struct AuthorizationGate {
    resolver: PermissionResolver,
    cache: Arc<PermissionCache>,
}

impl AuthorizationGate {
    pub fn new(resolver: PermissionResolver, cache: Arc<PermissionCache>) -> Self {
        Self { resolver, cache }
    }

    pub fn cache(&self) -> &Arc<PermissionCache> {
        &self.cache
    }

    pub async fn authorize(&self, principal: &Principal, code: &str) -> AppResult<Decision> {
        if principal.is_super_admin() {
            tracing::debug!(user_id = %principal.user_id, code = %code, "super_admin bypass");
            return Ok(Decision::Allow);
        }

        let effective = self.effective_permissions(principal).await?;
        if effective.contains(code) {
            tracing::debug!(user_id = %principal.user_id, code = %code, "page permission match");
            Ok(Decision::Allow)
        } else {
            tracing::debug!(user_id = %principal.user_id, code = %code, "permission denied");
            Ok(Decision::Deny { code: code.to_string() })
        }
    }

    /// Fails with `PermissionDenied` unless `principal` may use `code`.
    pub async fn require(&self, principal: &Principal, code: &str) -> AppResult<()> {
        match self.authorize(principal, code).await? {
            Decision::Allow => Ok(()),
            Decision::Deny { code } => Err(AppError::permission_denied(code)),
        }
    }

    pub async fn effective_permissions(&self, principal: &Principal) -> AppResult<BTreeSet<String>> {
        if principal.is_super_admin() {
            return self.resolver.resolve(principal).await;
        }

        if let Some(codes) = self.cache.get(principal).await {
            tracing::debug!(user_id = %principal.user_id, "permission cache hit");
            return Ok(codes);
        }

        let ticket = self.cache.ticket();
        let codes = self.resolver.resolve(principal).await?;
        self.cache.put(ticket, principal, &codes).await;

        Ok(codes)
    }
}
