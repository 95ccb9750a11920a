//! `RBACEvaluator`: answers "does principal P hold permission Q?" per spec §4.6.
//!
//! Grounded on `original_source/.../servicios.py::ServicioRBAC` (cache-then-repository
//! fallback shape) and `modelos.py::Rol.has_permission` (wildcard precedence, now in
//! [`crate::graph::permission_satisfied`]). Audit-on-denial uses `common_audit::AuditProducer`,
//! matching how the teacher's POS services already emit fire-and-forget audit events.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use common_audit::{AuditActor, AuditProducer, AuditSeverity};
use uuid::Uuid;

use crate::cache::PermissionCache;
use crate::graph::{self, RoleGraph};

/// Supplies the role graph for a tenant. Implemented by `auth-service`'s role
/// repository; kept as a trait here so `common-security` never depends on sqlx.
#[async_trait]
pub trait RoleGraphSource: Send + Sync {
    async fn load_role_graph(&self, tenant_id: Uuid) -> anyhow::Result<RoleGraph>;
}

pub struct RBACEvaluator {
    source: Arc<dyn RoleGraphSource>,
    cache: Arc<PermissionCache>,
    audit: Option<AuditProducer>,
}

pub struct Principal {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub active: bool,
    pub role_ids: Vec<Uuid>,
}

impl RBACEvaluator {
    pub fn new(
        source: Arc<dyn RoleGraphSource>,
        cache: Arc<PermissionCache>,
        audit: Option<AuditProducer>,
    ) -> Self {
        Self {
            source,
            cache,
            audit,
        }
    }

    /// `hasPermission(principal, required)` from spec §4.6. Expands every one of the
    /// principal's roles to its fully-resolved permission set (cache-first, graph
    /// walk on miss) and checks the union against `required` using wildcard rules.
    pub async fn has_permission(&self, principal: &Principal, required: &str) -> anyhow::Result<bool> {
        if !principal.active {
            return Ok(false);
        }

        let mut held: HashSet<String> = HashSet::new();
        let mut graph: Option<RoleGraph> = None;

        for &role_id in &principal.role_ids {
            if let Some(cached) = self.cache.get(role_id) {
                held.extend(cached);
                continue;
            }

            if graph.is_none() {
                graph = Some(self.source.load_role_graph(principal.tenant_id).await?);
            }
            let g = graph.as_ref().expect("just populated");
            let expanded = graph::expand_permissions(role_id, g);
            self.cache.set(role_id, expanded.clone());
            held.extend(expanded);
        }

        let granted = graph::permission_satisfied(&held, required);
        if !granted {
            self.emit_denial(principal, required).await;
        }
        Ok(granted)
    }

    async fn emit_denial(&self, principal: &Principal, required: &str) {
        if let Some(audit) = &self.audit {
            let _ = audit
                .emit(
                    principal.tenant_id,
                    AuditActor {
                        id: Some(principal.id),
                        name: None,
                        email: None,
                    },
                    "permission",
                    None,
                    "permission_denied",
                    "auth-service",
                    AuditSeverity::Warning,
                    None,
                    serde_json::json!({ "required": required }),
                    serde_json::json!({}),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::RoleNode;
    use std::time::Duration;

    struct StaticSource(RoleGraph);

    #[async_trait]
    impl RoleGraphSource for StaticSource {
        async fn load_role_graph(&self, _tenant_id: Uuid) -> anyhow::Result<RoleGraph> {
            Ok(self.0.clone())
        }
    }

    fn node(id: Uuid, parent: Option<Uuid>, perms: &[&str]) -> RoleNode {
        RoleNode {
            id,
            name: id.to_string(),
            parent_id: parent,
            permissions: perms.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn inactive_principal_is_always_denied() {
        let role = Uuid::new_v4();
        let mut graph = RoleGraph::new();
        graph.insert(role, node(role, None, &["*:*"]));
        let evaluator = RBACEvaluator::new(
            Arc::new(StaticSource(graph)),
            Arc::new(PermissionCache::new(Duration::from_secs(60))),
            None,
        );
        let principal = Principal {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            active: false,
            role_ids: vec![role],
        };
        assert!(!evaluator.has_permission(&principal, "users:read").await.unwrap());
    }

    #[tokio::test]
    async fn inherited_permission_is_granted() {
        let parent = Uuid::new_v4();
        let child = Uuid::new_v4();
        let mut graph = RoleGraph::new();
        graph.insert(parent, node(parent, None, &["users:read"]));
        graph.insert(child, node(child, Some(parent), &["orders:write"]));

        let evaluator = RBACEvaluator::new(
            Arc::new(StaticSource(graph)),
            Arc::new(PermissionCache::new(Duration::from_secs(60))),
            None,
        );
        let principal = Principal {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            active: true,
            role_ids: vec![child],
        };
        assert!(evaluator.has_permission(&principal, "users:read").await.unwrap());
        assert!(evaluator.has_permission(&principal, "orders:write").await.unwrap());
        assert!(!evaluator.has_permission(&principal, "payments:write").await.unwrap());
    }
}
