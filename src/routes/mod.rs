pub mod authz;
pub mod departments;
pub mod health;
pub mod permissions;
