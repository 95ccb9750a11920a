pub mod cache;
pub mod error;
pub mod graph;
pub mod rbac;

pub use cache::PermissionCache;
pub use error::SecurityError;
pub use graph::{RoleGraph, RoleNode};
pub use rbac::{Principal, RBACEvaluator, RoleGraphSource};
