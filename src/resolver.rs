//! Variable resolution: turning a node's declared assignee spec
//! (`assignType`/`assignValue`, carried on `GraphNode` as `process_method`/
//! `processor`) plus creator/actor context into concrete user ids (C2).
//!
//! Dispatches on the declared `assignType`, mirroring `GetVariableValue`
//! being called once per routed state entry in the original service, after
//! `process_method`/`processor` have been copied from the target node.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineResult;

/// Narrow read-only view onto user/role/department data the engine needs to
/// resolve assignees and authorize transitions. Never owns user/role
/// administration (Non-goal) — a caller supplies an implementation backed by
/// whatever directory service already exists.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_exists(&self, user_id: i64) -> EngineResult<bool>;
    async fn users_in_role(&self, role_id: i64) -> EngineResult<Vec<i64>>;
    async fn role_ids_for_user(&self, user_id: i64) -> EngineResult<Vec<i64>>;
    async fn users_in_department(&self, dept_id: i64) -> EngineResult<Vec<i64>>;
    async fn department_ids_for_user(&self, user_id: i64) -> EngineResult<Vec<i64>>;
    async fn display_name(&self, user_id: i64) -> EngineResult<Option<String>>;
    async fn email_for_user(&self, user_id: i64) -> EngineResult<Option<String>>;
}

/// Creator id and current actor id, threaded through from the engine so
/// `variable`/`creator` assign types can resolve without the resolver
/// touching `WorkOrder`/`HandleWorkOrderRequest` directly.
#[derive(Debug, Clone, Copy)]
pub struct AssigneeContext {
    pub creator_id: i64,
    pub acting_user_id: Option<i64>,
}

/// Expands a node's `(assignType, assignValue)` pair into a concrete list of
/// user ids, per the assignType table:
///
/// | assignType | assignValue | result |
/// |---|---|---|
/// | `person` | list of user ids | ids as-is |
/// | `role` | list of role ids | all users bearing any role |
/// | `department` | list of dept ids | all users in any dept |
/// | `variable` | `creator` or `processor` | creator's user id / current actor |
/// | `creator` | (ignored) | work order's creator |
///
/// An absent or unrecognized `assign_type` is treated as `person`: the
/// values are literal user ids, which is also what a bare `ActiveClaim` body
/// produces when it has no assignType of its own.
pub async fn resolve_processor(
    assign_type: Option<&str>,
    assign_value: &[Value],
    context: &AssigneeContext,
    directory: &dyn UserDirectory,
) -> EngineResult<Vec<Value>> {
    match assign_type {
        Some("role") => {
            let mut resolved = Vec::new();
            for role_id in assign_value.iter().filter_map(Value::as_i64) {
                resolved.extend(directory.users_in_role(role_id).await?.into_iter().map(Value::from));
            }
            Ok(resolved)
        }
        Some("department") => {
            let mut resolved = Vec::new();
            for dept_id in assign_value.iter().filter_map(Value::as_i64) {
                resolved.extend(directory.users_in_department(dept_id).await?.into_iter().map(Value::from));
            }
            Ok(resolved)
        }
        Some("variable") => match assign_value.first().and_then(Value::as_str) {
            Some("creator") => Ok(vec![Value::from(context.creator_id)]),
            Some("processor") => Ok(context.acting_user_id.map(|id| vec![Value::from(id)]).unwrap_or_default()),
            _ => Ok(vec![]),
        },
        Some("creator") => Ok(vec![Value::from(context.creator_id)]),
        _ => Ok(assign_value.to_vec()),
    }
}

/// Merge an arbitrary number of form-data JSON objects into one, later
/// entries overriding earlier ones on key collision. Mirrors the original
/// service's "merge all submitted template data before evaluating
/// conditions/assignees" behavior.
pub fn merge_form_data(parts: &[&Value]) -> Value {
    let mut merged = serde_json::Map::new();
    for part in parts {
        if let Value::Object(map) = part {
            for (k, v) in map {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeDirectory {
        role_members: Mutex<Vec<(i64, Vec<i64>)>>,
        dept_members: Mutex<Vec<(i64, Vec<i64>)>>,
    }

    impl FakeDirectory {
        fn new() -> Self {
            FakeDirectory { role_members: Mutex::new(vec![]), dept_members: Mutex::new(vec![]) }
        }
    }

    #[async_trait]
    impl UserDirectory for FakeDirectory {
        async fn user_exists(&self, _user_id: i64) -> EngineResult<bool> {
            Ok(true)
        }
        async fn users_in_role(&self, role_id: i64) -> EngineResult<Vec<i64>> {
            Ok(self
                .role_members
                .lock()
                .unwrap()
                .iter()
                .find(|(r, _)| *r == role_id)
                .map(|(_, users)| users.clone())
                .unwrap_or_default())
        }
        async fn role_ids_for_user(&self, _user_id: i64) -> EngineResult<Vec<i64>> {
            Ok(vec![])
        }
        async fn users_in_department(&self, dept_id: i64) -> EngineResult<Vec<i64>> {
            Ok(self
                .dept_members
                .lock()
                .unwrap()
                .iter()
                .find(|(d, _)| *d == dept_id)
                .map(|(_, users)| users.clone())
                .unwrap_or_default())
        }
        async fn department_ids_for_user(&self, _user_id: i64) -> EngineResult<Vec<i64>> {
            Ok(vec![])
        }
        async fn display_name(&self, _user_id: i64) -> EngineResult<Option<String>> {
            Ok(None)
        }
        async fn email_for_user(&self, _user_id: i64) -> EngineResult<Option<String>> {
            Ok(None)
        }
    }

    fn ctx(creator: i64, actor: Option<i64>) -> AssigneeContext {
        AssigneeContext { creator_id: creator, acting_user_id: actor }
    }

    #[tokio::test]
    async fn person_assignment_passes_ids_through() {
        let dir = FakeDirectory::new();
        let resolved = resolve_processor(Some("person"), &[json!(42)], &ctx(1, Some(1)), &dir).await.unwrap();
        assert_eq!(resolved, vec![json!(42)]);
    }

    #[tokio::test]
    async fn role_assignment_expands_to_members() {
        let dir = FakeDirectory::new();
        dir.role_members.lock().unwrap().push((5, vec![1, 2, 3]));
        let resolved = resolve_processor(Some("role"), &[json!(5)], &ctx(1, Some(1)), &dir).await.unwrap();
        assert_eq!(resolved, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn department_assignment_expands_to_members() {
        let dir = FakeDirectory::new();
        dir.dept_members.lock().unwrap().push((9, vec![7, 8]));
        let resolved = resolve_processor(Some("department"), &[json!(9)], &ctx(1, Some(1)), &dir).await.unwrap();
        assert_eq!(resolved, vec![json!(7), json!(8)]);
    }

    #[tokio::test]
    async fn variable_creator_resolves_to_work_order_creator() {
        let dir = FakeDirectory::new();
        let resolved = resolve_processor(Some("variable"), &[json!("creator")], &ctx(11, Some(42)), &dir).await.unwrap();
        assert_eq!(resolved, vec![json!(11)]);
    }

    #[tokio::test]
    async fn variable_processor_resolves_to_current_actor() {
        let dir = FakeDirectory::new();
        let resolved = resolve_processor(Some("variable"), &[json!("processor")], &ctx(11, Some(42)), &dir).await.unwrap();
        assert_eq!(resolved, vec![json!(42)]);
    }

    #[tokio::test]
    async fn creator_assign_type_ignores_assign_value() {
        let dir = FakeDirectory::new();
        let resolved = resolve_processor(Some("creator"), &[json!(999)], &ctx(11, Some(42)), &dir).await.unwrap();
        assert_eq!(resolved, vec![json!(11)]);
    }

    #[test]
    fn merge_overrides_left_to_right() {
        let a = json!({"x": 1, "y": 1});
        let b = json!({"y": 2});
        assert_eq!(merge_form_data(&[&a, &b]), json!({"x": 1, "y": 2}));
    }
}
