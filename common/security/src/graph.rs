//! In-memory representation of the role inheritance DAG used by [`crate::rbac`].
//!
//! Grounded on `original_source/.../servicios.py::ServicioJerarquiaRoles` (inherited
//! permission union, BFS cycle check) and `modelos.py::Rol.has_permission` (wildcard
//! precedence). Repositories hand back `RoleNode`s; nothing here talks to a database.

use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RoleNode {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub permissions: HashSet<String>,
}

/// All roles in a tenant, keyed by id. Built fresh from the role repository for
/// each operation that needs graph traversal (cycle check, permission expansion).
pub type RoleGraph = HashMap<Uuid, RoleNode>;

/// Union of `role_id`'s own permissions with every ancestor's, walked via `parent_id`.
/// A role graph is expected to be a DAG; a cycle here would loop forever, so we bound
/// the walk by the graph size as a defensive backstop.
pub fn expand_permissions(role_id: Uuid, graph: &RoleGraph) -> HashSet<String> {
    let mut out = HashSet::new();
    let mut current = Some(role_id);
    let mut steps = 0;
    while let Some(id) = current {
        if steps > graph.len() {
            break;
        }
        steps += 1;
        let Some(node) = graph.get(&id) else { break };
        out.extend(node.permissions.iter().cloned());
        current = node.parent_id;
    }
    out
}

/// True if setting `role_id.parent_id = Some(candidate_parent)` would close a cycle,
/// i.e. `role_id` is already reachable by walking up from `candidate_parent`.
pub fn would_create_cycle(role_id: Uuid, candidate_parent: Uuid, graph: &RoleGraph) -> bool {
    if role_id == candidate_parent {
        return true;
    }
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([candidate_parent]);
    while let Some(id) = queue.pop_front() {
        if id == role_id {
            return true;
        }
        if !visited.insert(id) {
            continue;
        }
        if let Some(node) = graph.get(&id) {
            if let Some(parent) = node.parent_id {
                queue.push_back(parent);
            }
        }
    }
    false
}

/// Direct and transitive children of `role_id`, used to size invalidation fan-out
/// when a role's own permissions change.
pub fn descendants_of(role_id: Uuid, graph: &RoleGraph) -> HashSet<Uuid> {
    let mut children_of: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for node in graph.values() {
        if let Some(parent) = node.parent_id {
            children_of.entry(parent).or_default().push(node.id);
        }
    }

    let mut out = HashSet::new();
    let mut queue = VecDeque::from([role_id]);
    while let Some(id) = queue.pop_front() {
        if let Some(children) = children_of.get(&id) {
            for &child in children {
                if out.insert(child) {
                    queue.push_back(child);
                }
            }
        }
    }
    out
}

/// `scope:action` is covered by `held` if `held` contains any of the four wildcard
/// combinations spelled out in the spec's RBAC invariant.
pub fn permission_satisfied(held: &HashSet<String>, required: &str) -> bool {
    if held.contains("*:*") || held.contains(required) {
        return true;
    }
    let Some((scope, action)) = required.split_once(':') else {
        return false;
    };
    held.contains(&format!("{scope}:*")) || held.contains(&format!("*:{action}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: Uuid, parent: Option<Uuid>, perms: &[&str]) -> RoleNode {
        RoleNode {
            id,
            name: id.to_string(),
            parent_id: parent,
            permissions: perms.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn expand_unions_ancestors() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let mut graph = RoleGraph::new();
        graph.insert(a, node(a, None, &["users:read"]));
        graph.insert(b, node(b, Some(a), &["users:write"]));
        graph.insert(c, node(c, Some(b), &["orders:read"]));

        let perms = expand_permissions(c, &graph);
        assert!(perms.contains("users:read"));
        assert!(perms.contains("users:write"));
        assert!(perms.contains("orders:read"));
    }

    #[test]
    fn cycle_detected() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let mut graph = RoleGraph::new();
        graph.insert(a, node(a, Some(c), &[]));
        graph.insert(b, node(b, Some(a), &[]));
        graph.insert(c, node(c, Some(b), &[]));

        // A -> C -> B -> A already a cycle in this fixture; assigning A's parent to C
        // (itself already A's grandchild-via-B) must be rejected.
        assert!(would_create_cycle(a, c, &graph));
    }

    #[test]
    fn wildcard_precedence() {
        let mut held = HashSet::new();
        held.insert("users:*".to_string());
        assert!(permission_satisfied(&held, "users:write"));
        assert!(!permission_satisfied(&held, "orders:write"));

        held.clear();
        held.insert("*:read".to_string());
        assert!(permission_satisfied(&held, "orders:read"));
        assert!(!permission_satisfied(&held, "orders:write"));

        held.clear();
        held.insert("*:*".to_string());
        assert!(permission_satisfied(&held, "anything:at-all"));
    }
}
