//! Authorization module - page-permission engine
//!
//! This module implements:
//! - Effective permission resolution (department base, user overrides, ancestor expansion)
//! - A write-through permission cache with explicit invalidation
//! - The request-time gate that turns a page code into allow/deny
//! - Administrative writes with audit logging

pub mod admin;
pub mod cache;
mod gate;
mod principal;
mod resolver;

pub use admin::{Actor, PermissionAdmin, UpdateTargetPermissions};
pub use cache::{CacheBackend, CacheConfig, CacheError, CacheTicket, MokaBackend, PermissionCache};
pub use gate::{AuthorizationGate, Decision};
pub use principal::Principal;
pub use resolver::{effective_codes, PermissionResolver};

/// Page codes the service itself guards with.
pub mod pages {
    pub const SYSTEM_DEPARTMENTS: &str = "system.departments";
}
